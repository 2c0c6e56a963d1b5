// Scene collections and the contracts of everything that records GPU work
//
// Drawables, shadow casters, particle systems, postprocessing, the overlay
// and the light rig are opaque here: they get a recorder, a command buffer
// and a frame index and emit commands. None of them touch synchronization.
// Animated objects only write CPU-side per-frame data.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ash::vk;
use glam::Vec3;
use parking_lot::RwLock;

use crate::backend::{CommandRecorder, Resolution};

/// Closed set of things the main pass draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawableKind {
    Shape,
    Sprite,
    Terrain,
    Model,
    ParticleSystem,
}

pub trait Drawable: Send + Sync {
    fn kind(&self) -> DrawableKind;
    fn record(&self, recorder: &dyn CommandRecorder, cmd: vk::CommandBuffer, frame: usize) -> Result<()>;
    /// World-space position used to depth-sort transparent objects.
    fn position(&self) -> Vec3 {
        Vec3::ZERO
    }
}

/// A light, by index into the rig's directional or point lights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightRef {
    Directional(usize),
    Point(usize),
}

/// What a shadow pass renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowTarget {
    Directional { light: usize },
    PointFace { light: usize, face: usize },
}

pub trait Shadowable: Send + Sync {
    fn record_shadow(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        frame: usize,
        target: ShadowTarget,
    ) -> Result<()>;
}

pub trait ParticleSimulation: Send + Sync {
    fn record_compute(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        frame: usize,
        elapsed: Duration,
    ) -> Result<()>;
}

/// Joint / skeleton updates. Runs on a worker and writes the data of
/// `frame`, whose previous GPU use has completed.
pub trait Animated: Send + Sync {
    fn update_animation(&self, frame: usize, elapsed: Duration) -> Result<()>;
}

/// Bloom blur plus the final composite into the swapchain image.
pub trait PostProcess: Send + Sync {
    fn record_blur(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        frame: usize,
        horizontal: bool,
    ) -> Result<()>;
    fn record_composite(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        frame: usize,
        image_index: u32,
    ) -> Result<()>;
}

/// GUI / debug overlay drawn on top of the composited image.
pub trait Overlay: Send + Sync {
    fn record(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        frame: usize,
        image_index: u32,
    ) -> Result<()>;
}

/// Depth image a shadow pass renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowAttachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub resolution: Resolution,
}

pub trait LightRig: Send + Sync {
    fn directional_lights(&self) -> usize;
    fn point_lights(&self) -> usize;
    /// For a point light the attachment is the whole six-layer cubemap and
    /// `view` selects the face.
    fn shadow_attachment(&self, target: ShadowTarget, frame: usize) -> ShadowAttachment;
    fn soft_shadows(&self, light: LightRef) -> bool;
    fn record_blur(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        frame: usize,
        light: LightRef,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blend {
    Opaque,
    Transparent,
}

struct Entry {
    id: ObjectId,
    drawable: Option<(Arc<dyn Drawable>, Blend)>,
    shadowable: Option<Arc<dyn Shadowable>>,
    particles: Option<Arc<dyn ParticleSimulation>>,
    animated: Option<Arc<dyn Animated>>,
}

/// An object taken out of the scene, kept alive until the GPU is done with it.
pub struct Retired {
    pub id: ObjectId,
    pub drawable: Option<Arc<dyn Drawable>>,
    pub shadowable: Option<Arc<dyn Shadowable>>,
    pub particles: Option<Arc<dyn ParticleSimulation>>,
    pub animated: Option<Arc<dyn Animated>>,
}

/// Immutable view handed to recording workers.
#[derive(Clone)]
pub struct SceneSnapshot {
    pub camera_eye: Vec3,
    pub opaque: Arc<[Arc<dyn Drawable>]>,
    /// Back to front.
    pub transparent: Arc<[Arc<dyn Drawable>]>,
    pub shadowables: Arc<[Arc<dyn Shadowable>]>,
    pub particles: Arc<[Arc<dyn ParticleSimulation>]>,
    pub animated: Arc<[Arc<dyn Animated>]>,
    pub lights: Option<Arc<dyn LightRig>>,
    pub postprocess: Option<Arc<dyn PostProcess>>,
    pub overlay: Option<Arc<dyn Overlay>>,
}

impl SceneSnapshot {
    pub fn drawables(&self) -> impl Iterator<Item = &Arc<dyn Drawable>> {
        self.opaque.iter().chain(self.transparent.iter())
    }
}

#[derive(Default)]
pub struct Scene {
    next_id: u64,
    entries: Vec<Entry>,
    retired: Vec<Retired>,
    camera_eye: Vec3,
    lights: Option<Arc<dyn LightRig>>,
    postprocess: Option<Arc<dyn PostProcess>>,
    overlay: Option<Arc<dyn Overlay>>,
}

pub type SharedScene = Arc<RwLock<Scene>>;

impl Scene {
    pub fn shared() -> SharedScene {
        Arc::new(RwLock::new(Scene::default()))
    }

    fn insert(&mut self, mut entry: Entry) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        entry.id = id;
        self.entries.push(entry);
        id
    }

    /// Adds an object that is drawn and, optionally, casts shadows.
    pub fn add_object<T>(&mut self, object: Arc<T>, blend: Blend, casts_shadow: bool) -> ObjectId
    where
        T: Drawable + Shadowable + 'static,
    {
        let shadowable: Arc<dyn Shadowable> = object.clone();
        let drawable: Arc<dyn Drawable> = object;
        self.insert(Entry {
            id: ObjectId(0),
            drawable: Some((drawable, blend)),
            shadowable: casts_shadow.then_some(shadowable),
            particles: None,
            animated: None,
        })
    }

    pub fn add_drawable(&mut self, drawable: Arc<dyn Drawable>, blend: Blend) -> ObjectId {
        self.insert(Entry {
            id: ObjectId(0),
            drawable: Some((drawable, blend)),
            shadowable: None,
            particles: None,
            animated: None,
        })
    }

    pub fn add_shadowable(&mut self, shadowable: Arc<dyn Shadowable>) -> ObjectId {
        self.insert(Entry {
            id: ObjectId(0),
            drawable: None,
            shadowable: Some(shadowable),
            particles: None,
            animated: None,
        })
    }

    /// Particle systems are simulated in the pre-compute batch and drawn in
    /// the main pass.
    pub fn add_particle_system<T>(&mut self, system: Arc<T>, blend: Blend) -> ObjectId
    where
        T: Drawable + ParticleSimulation + 'static,
    {
        let particles: Arc<dyn ParticleSimulation> = system.clone();
        let drawable: Arc<dyn Drawable> = system;
        self.insert(Entry {
            id: ObjectId(0),
            drawable: Some((drawable, blend)),
            shadowable: None,
            particles: Some(particles),
            animated: None,
        })
    }

    /// Like `add_object`, plus a per-frame animation update.
    pub fn add_animated_object<T>(&mut self, object: Arc<T>, blend: Blend, casts_shadow: bool) -> ObjectId
    where
        T: Drawable + Shadowable + Animated + 'static,
    {
        let animated: Arc<dyn Animated> = object.clone();
        let id = self.add_object(object, blend, casts_shadow);
        if let Some(entry) = self.entries.last_mut() {
            entry.animated = Some(animated);
        }
        id
    }

    /// Takes the object out of every collection. It is not dropped here:
    /// frames in flight may still reference it.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        let Some(pos) = self.entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        self.retired.push(Retired {
            id: entry.id,
            drawable: entry.drawable.map(|(drawable, _)| drawable),
            shadowable: entry.shadowable,
            particles: entry.particles,
            animated: entry.animated,
        });
        true
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn take_retired(&mut self) -> Vec<Retired> {
        std::mem::take(&mut self.retired)
    }

    pub fn set_camera_eye(&mut self, eye: Vec3) {
        self.camera_eye = eye;
    }

    pub fn set_lights(&mut self, lights: Option<Arc<dyn LightRig>>) {
        self.lights = lights;
    }

    pub fn set_postprocess(&mut self, postprocess: Option<Arc<dyn PostProcess>>) {
        self.postprocess = postprocess;
    }

    pub fn set_overlay(&mut self, overlay: Option<Arc<dyn Overlay>>) {
        self.overlay = overlay;
    }

    pub fn snapshot(&self) -> SceneSnapshot {
        let mut opaque = Vec::new();
        let mut transparent = Vec::new();
        for (drawable, blend) in self.entries.iter().filter_map(|e| e.drawable.as_ref()) {
            match blend {
                Blend::Opaque => opaque.push(drawable.clone()),
                Blend::Transparent => transparent.push(drawable.clone()),
            }
        }

        let eye = self.camera_eye;
        transparent.sort_by(|a: &Arc<dyn Drawable>, b: &Arc<dyn Drawable>| {
            let da = a.position().distance_squared(eye);
            let db = b.position().distance_squared(eye);
            db.total_cmp(&da)
        });

        SceneSnapshot {
            camera_eye: eye,
            opaque: opaque.into(),
            transparent: transparent.into(),
            shadowables: self
                .entries
                .iter()
                .filter_map(|e| e.shadowable.clone())
                .collect(),
            particles: self
                .entries
                .iter()
                .filter_map(|e| e.particles.clone())
                .collect(),
            animated: self
                .entries
                .iter()
                .filter_map(|e| e.animated.clone())
                .collect(),
            lights: self.lights.clone(),
            postprocess: self.postprocess.clone(),
            overlay: self.overlay.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Minimal drawable that records a label.
    #[derive(Default)]
    pub struct Quad {
        pub position: Vec3,
    }

    impl Quad {
        pub fn at(position: Vec3) -> Self {
            Self { position }
        }
    }

    impl Drawable for Quad {
        fn kind(&self) -> DrawableKind {
            DrawableKind::Shape
        }

        fn record(&self, recorder: &dyn CommandRecorder, cmd: vk::CommandBuffer, _frame: usize) -> Result<()> {
            recorder.begin_label(cmd, "quad");
            recorder.end_label(cmd);
            Ok(())
        }

        fn position(&self) -> Vec3 {
            self.position
        }
    }

    impl Shadowable for Quad {
        fn record_shadow(
            &self,
            recorder: &dyn CommandRecorder,
            cmd: vk::CommandBuffer,
            _frame: usize,
            _target: ShadowTarget,
        ) -> Result<()> {
            recorder.begin_label(cmd, "quad shadow");
            recorder.end_label(cmd);
            Ok(())
        }
    }
}
