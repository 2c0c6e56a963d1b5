// Render target set
//
// Per frame slot: HDR color plus the two bloom ping-pong images. One depth
// buffer shared by every slot. Swapchain images belong to the presenter and
// are never transitioned here: they may only be touched once acquired.
//
// Rebuilt from scratch on every resize, never patched.

use anyhow::{Context, Result};
use ash::vk;

use crate::backend::{Attachment, AttachmentDesc, GpuDevice, ImageTransition, QueueKind, Resolution};

#[derive(Debug)]
pub struct FrameTargets {
    pub color: Attachment,
    pub blur_in: Attachment,
    pub blur_out: Attachment,
}

impl FrameTargets {
    fn all(&self) -> [&Attachment; 3] {
        [&self.color, &self.blur_in, &self.blur_out]
    }
}

/// Summary used to check that a rebuild at the same size is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    pub attachment_count: usize,
    pub resolution: Resolution,
    pub formats: Vec<vk::Format>,
}

pub struct RenderTargets {
    frames_in_flight: usize,
    color_format: vk::Format,
    depth_format: vk::Format,
    resolution: Resolution,
    frames: Vec<FrameTargets>,
    depth: Option<Attachment>,
    init_pool: vk::CommandPool,
    init_cmd: vk::CommandBuffer,
    init_pending: bool,
}

impl RenderTargets {
    pub fn new(
        device: &dyn GpuDevice,
        frames_in_flight: usize,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let init_pool = device.create_command_pool(QueueKind::Graphics)?;
        let init_cmd = device
            .allocate_command_buffers(init_pool, 1)?
            .into_iter()
            .next()
            .context("No initialization command buffer allocated")?;
        Ok(Self {
            frames_in_flight,
            color_format,
            depth_format,
            resolution: Resolution::default(),
            frames: Vec::new(),
            depth: None,
            init_pool,
            init_cmd,
            init_pending: false,
        })
    }

    fn color_desc(&self, label: String, resolution: Resolution) -> AttachmentDesc {
        AttachmentDesc {
            label,
            format: self.color_format,
            resolution,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Allocates every attachment and records the layout initialization.
    ///
    /// The recorded command buffer is handed out by
    /// `take_pending_initialization` and submitted with the next frame.
    pub fn initialize(&mut self, device: &dyn GpuDevice, resolution: Resolution) -> Result<()> {
        self.resolution = resolution;
        if resolution.is_zero() {
            log::debug!("Zero resolution, render targets not allocated");
            return Ok(());
        }

        for slot in 0..self.frames_in_flight {
            let frame = FrameTargets {
                color: device.create_attachment(&self.color_desc(format!("Color {}", slot), resolution))?,
                blur_in: device.create_attachment(&self.color_desc(format!("Blur in {}", slot), resolution))?,
                blur_out: device.create_attachment(&self.color_desc(format!("Blur out {}", slot), resolution))?,
            };
            self.frames.push(frame);
        }
        self.depth = Some(device.create_attachment(&AttachmentDesc {
            label: "Depth".to_string(),
            format: self.depth_format,
            resolution,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        })?);

        self.record_initialization(device)?;
        log::info!(
            "Render targets ready: {}x{}, {} attachments",
            resolution.width,
            resolution.height,
            self.attachment_count()
        );
        Ok(())
    }

    fn record_initialization(&mut self, device: &dyn GpuDevice) -> Result<()> {
        let cmd = self.init_cmd;
        let mut transitions: Vec<ImageTransition> = self
            .frames
            .iter()
            .flat_map(|frame| frame.all())
            .map(|attachment| {
                ImageTransition::color(attachment.image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
                    .stages(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                    )
            })
            .collect();
        if let Some(depth) = &self.depth {
            transitions.push(
                ImageTransition::color(
                    depth.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                )
                .aspect(vk::ImageAspectFlags::DEPTH, 1)
                .stages(
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                ),
            );
        }

        device.begin_commands(cmd)?;
        device.begin_label(cmd, "Render target initialization");
        device.transition_images(cmd, &transitions);
        device.end_label(cmd);
        device.end_commands(cmd)?;
        self.init_pending = true;
        Ok(())
    }

    /// Full teardown then `initialize`. The GPU must be idle.
    pub fn rebuild(&mut self, device: &dyn GpuDevice, resolution: Resolution) -> Result<()> {
        self.release_attachments(device)?;
        self.initialize(device, resolution)
    }

    /// The recorded initialization, once.
    pub fn take_pending_initialization(&mut self) -> Option<vk::CommandBuffer> {
        std::mem::take(&mut self.init_pending).then_some(self.init_cmd)
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn attachment_count(&self) -> usize {
        self.frames.len() * 3 + usize::from(self.depth.is_some())
    }

    pub fn layout(&self) -> TargetLayout {
        let mut formats: Vec<vk::Format> = self
            .frames
            .iter()
            .flat_map(|frame| frame.all())
            .chain(self.depth.iter())
            .map(|attachment| attachment.desc.format)
            .collect();
        formats.dedup();
        TargetLayout {
            attachment_count: self.attachment_count(),
            resolution: self.resolution,
            formats,
        }
    }

    pub fn frame(&self, slot: usize) -> Option<&FrameTargets> {
        self.frames.get(slot)
    }

    pub fn depth(&self) -> Option<&Attachment> {
        self.depth.as_ref()
    }

    fn release_attachments(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for frame in self.frames.drain(..) {
            device.destroy_attachment(frame.color)?;
            device.destroy_attachment(frame.blur_in)?;
            device.destroy_attachment(frame.blur_out)?;
        }
        if let Some(depth) = self.depth.take() {
            device.destroy_attachment(depth)?;
        }
        self.init_pending = false;
        Ok(())
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        self.release_attachments(device)?;
        device.destroy_command_pool(self.init_pool);
        Ok(())
    }
}
