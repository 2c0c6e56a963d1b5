// Shadow work items
//
// One item per directional shadow map, per point light cubemap face and per
// soft-shadow blur. Every item owns a command pool so workers never share
// one, and one command buffer per frame slot.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::backend::{CommandRecorder, GpuDevice, ImageTransition, QueueKind, RenderingTarget};
use crate::scene::{LightRef, LightRig, Shadowable, ShadowTarget};

pub const CUBE_FACES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowWork {
    Map(ShadowTarget),
    Blur(LightRef),
}

impl ShadowWork {
    /// GPU debug label of the pass.
    pub fn name(&self) -> String {
        match *self {
            ShadowWork::Map(ShadowTarget::Directional { light }) => {
                format!("Directional shadow {}", light)
            }
            ShadowWork::Map(ShadowTarget::PointFace { light, face }) => {
                format!("Point shadow {} face {}", light, face)
            }
            ShadowWork::Blur(LightRef::Directional(light)) => {
                format!("Directional shadow blur {}", light)
            }
            ShadowWork::Blur(LightRef::Point(light)) => format!("Point shadow blur {}", light),
        }
    }
}

#[derive(Debug)]
pub struct ShadowWorkItem {
    pub work: ShadowWork,
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl ShadowWorkItem {
    fn new(device: &dyn GpuDevice, work: ShadowWork, frames_in_flight: usize) -> Result<Self> {
        let pool = device.create_command_pool(QueueKind::Graphics)?;
        let command_buffers = device.allocate_command_buffers(pool, frames_in_flight as u32)?;
        Ok(Self {
            work,
            pool,
            command_buffers,
        })
    }

    pub fn command_buffer(&self, frame: usize) -> vk::CommandBuffer {
        self.command_buffers[frame]
    }

    pub fn name(&self) -> String {
        self.work.name()
    }

    pub fn is_blur(&self) -> bool {
        matches!(self.work, ShadowWork::Blur(_))
    }
}

/// Shadow items for the current light setup, rebuilt when it changes.
#[derive(Debug, Default)]
pub struct ShadowWorkPlan {
    items: Vec<ShadowWorkItem>,
}

fn planned_work(lights: &dyn LightRig) -> Vec<ShadowWork> {
    let directional = lights.directional_lights();
    let point = lights.point_lights();

    let mut work: Vec<ShadowWork> = (0..directional)
        .map(|light| ShadowWork::Map(ShadowTarget::Directional { light }))
        .collect();
    for light in 0..point {
        work.extend((0..CUBE_FACES).map(|face| ShadowWork::Map(ShadowTarget::PointFace { light, face })));
    }
    // Blur runs after every map in the same graphics submission
    work.extend(
        (0..directional)
            .map(LightRef::Directional)
            .chain((0..point).map(LightRef::Point))
            .filter(|light| lights.soft_shadows(*light))
            .map(ShadowWork::Blur),
    );
    work
}

impl ShadowWorkPlan {
    fn current_work(&self) -> Vec<ShadowWork> {
        self.items.iter().map(|item| item.work).collect()
    }

    /// `false` when `sync` would replace the items.
    pub fn is_current(&self, lights: Option<&dyn LightRig>) -> bool {
        lights.map(planned_work).unwrap_or_default() == self.current_work()
    }

    /// Brings the items in line with `lights`. Existing items are kept when
    /// the plan did not change; otherwise the GPU must be idle.
    pub fn sync(&mut self, device: &dyn GpuDevice, lights: Option<&dyn LightRig>, frames_in_flight: usize) -> Result<()> {
        let wanted = lights.map(planned_work).unwrap_or_default();
        if wanted == self.current_work() {
            return Ok(());
        }

        self.destroy(device);
        self.items = wanted
            .into_iter()
            .map(|work| ShadowWorkItem::new(device, work, frames_in_flight))
            .collect::<Result<_>>()?;
        log::info!(
            "Shadow plan: {} maps, {} blurs",
            self.map_count(),
            self.blur_count()
        );
        Ok(())
    }

    pub fn items(&self) -> &[ShadowWorkItem] {
        &self.items
    }

    pub fn map_count(&self) -> usize {
        self.items.iter().filter(|item| !item.is_blur()).count()
    }

    pub fn blur_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_blur()).count()
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for item in self.items.drain(..) {
            device.destroy_command_pool(item.pool);
        }
    }
}

/// Depth bias applied to every shadow map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub slope: f32,
}

/// Records one shadow map into `cmd`.
pub fn record_shadow_map(
    recorder: &dyn CommandRecorder,
    cmd: vk::CommandBuffer,
    frame: usize,
    target: ShadowTarget,
    lights: &dyn LightRig,
    casters: &[Arc<dyn Shadowable>],
    bias: DepthBias,
) -> Result<()> {
    let attachment = lights.shadow_attachment(target, frame);
    let name = ShadowWork::Map(target).name();

    recorder.begin_commands(cmd)?;
    recorder.begin_label(cmd, &name);

    // A cubemap moves to attachment layout once, with its first face
    let transition = match target {
        ShadowTarget::Directional { .. } => Some(1),
        ShadowTarget::PointFace { face: 0, .. } => Some(CUBE_FACES as u32),
        ShadowTarget::PointFace { .. } => None,
    };
    if let Some(layers) = transition {
        recorder.transition_images(
            cmd,
            &[ImageTransition::color(
                attachment.image,
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
            .aspect(vk::ImageAspectFlags::DEPTH, layers)
            .stages(
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .access(
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )],
        );
    }

    recorder.begin_rendering(
        cmd,
        &RenderingTarget {
            color: Vec::new(),
            color_layout: vk::ImageLayout::UNDEFINED,
            depth: Some(attachment.view),
            resolution: attachment.resolution,
            clear: Some([1.0, 0.0, 0.0, 0.0]),
        },
    );
    recorder.set_depth_bias(cmd, bias.constant, bias.slope);
    for caster in casters {
        caster.record_shadow(recorder, cmd, frame, target)?;
    }
    recorder.end_rendering(cmd);

    recorder.end_label(cmd);
    recorder.end_commands(cmd)
}

pub fn record_shadow_blur(
    recorder: &dyn CommandRecorder,
    cmd: vk::CommandBuffer,
    frame: usize,
    light: LightRef,
    lights: &dyn LightRig,
) -> Result<()> {
    recorder.begin_commands(cmd)?;
    recorder.begin_label(cmd, &ShadowWork::Blur(light).name());
    lights.record_blur(recorder, cmd, frame, light)?;
    recorder.end_label(cmd);
    recorder.end_commands(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuCall, HeadlessDevice, Resolution};
    use crate::scene::{ShadowAttachment, Shadowable};
    use crate::scene::testing::Quad;
    use ash::vk::Handle;

    struct Rig {
        directional: usize,
        point: usize,
        soft: bool,
    }

    impl LightRig for Rig {
        fn directional_lights(&self) -> usize {
            self.directional
        }

        fn point_lights(&self) -> usize {
            self.point
        }

        fn shadow_attachment(&self, target: ShadowTarget, _frame: usize) -> ShadowAttachment {
            let raw = match target {
                ShadowTarget::Directional { light } => 100 + light as u64,
                ShadowTarget::PointFace { light, .. } => 200 + light as u64,
            };
            ShadowAttachment {
                image: vk::Image::from_raw(raw),
                view: vk::ImageView::from_raw(raw),
                resolution: Resolution::new(1024, 1024),
            }
        }

        fn soft_shadows(&self, _light: LightRef) -> bool {
            self.soft
        }

        fn record_blur(
            &self,
            _recorder: &dyn CommandRecorder,
            _cmd: vk::CommandBuffer,
            _frame: usize,
            _light: LightRef,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn plan_orders_maps_before_blurs() {
        let device = HeadlessDevice::new();
        let rig = Rig {
            directional: 4,
            point: 2,
            soft: true,
        };
        let mut plan = ShadowWorkPlan::default();
        plan.sync(&device, Some(&rig), 2).unwrap();

        assert_eq!(plan.map_count(), 4 + 2 * CUBE_FACES);
        assert_eq!(plan.blur_count(), 6);
        let first_blur = plan.items().iter().position(|item| item.is_blur()).unwrap();
        assert!(plan.items()[first_blur..].iter().all(|item| item.is_blur()));
        assert_eq!(plan.items()[0].name(), "Directional shadow 0");
        assert_eq!(plan.items()[4].name(), "Point shadow 0 face 0");
    }

    #[test]
    fn every_item_has_its_own_pool_and_buffers() {
        let device = HeadlessDevice::new();
        let rig = Rig {
            directional: 1,
            point: 1,
            soft: false,
        };
        let mut plan = ShadowWorkPlan::default();
        plan.sync(&device, Some(&rig), 3).unwrap();
        let items = plan.items();
        assert_eq!(items.len(), 7);
        for (i, a) in items.iter().enumerate() {
            for b in &items[i + 1..] {
                assert_ne!(a.pool, b.pool);
            }
        }
        assert_ne!(items[0].command_buffer(0), items[0].command_buffer(2));
    }

    #[test]
    fn unchanged_rig_keeps_items() {
        let device = HeadlessDevice::new();
        let rig = Rig {
            directional: 2,
            point: 0,
            soft: false,
        };
        let mut plan = ShadowWorkPlan::default();
        plan.sync(&device, Some(&rig), 2).unwrap();
        let pool = plan.items()[0].pool;
        plan.sync(&device, Some(&rig), 2).unwrap();
        assert_eq!(plan.items()[0].pool, pool);

        plan.sync(&device, None, 2).unwrap();
        assert!(plan.items().is_empty());
    }

    #[test]
    fn cubemap_transitions_once_per_light() {
        let device = HeadlessDevice::new();
        let rig = Rig {
            directional: 0,
            point: 1,
            soft: false,
        };
        let mut plan = ShadowWorkPlan::default();
        plan.sync(&device, Some(&rig), 1).unwrap();
        let casters: Vec<Arc<dyn Shadowable>> = vec![Arc::new(Quad::default())];
        let bias = DepthBias {
            constant: 1.25,
            slope: 1.75,
        };
        for item in plan.items() {
            let ShadowWork::Map(target) = item.work else { continue };
            record_shadow_map(&device, item.command_buffer(0), 0, target, &rig, &casters, bias).unwrap();
        }
        let barriers = device
            .calls()
            .iter()
            .filter(|call| matches!(call, GpuCall::Barrier { .. }))
            .count();
        assert_eq!(barriers, 1);
        let biases = device
            .calls()
            .iter()
            .filter(|call| matches!(call, GpuCall::DepthBias { .. }))
            .count();
        assert_eq!(biases, CUBE_FACES);
    }
}
