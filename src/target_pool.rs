//! Offscreen render targets owned by the composer.
//!
//! The pool holds every intermediate target a schedule can name: the
//! ping-pong pair, one custom target per effect that declares one, and the
//! side-output targets written by providers. Targets are keyed by role and
//! only reallocated when their descriptor changes, so a steady frame
//! allocates nothing.
//!
//! Viewport resizes are recorded as pending and applied at the start of the
//! next frame, never while a frame is being recorded.

use std::collections::HashMap;

use crate::effect::{Capabilities, EffectId};
use crate::renderer::{Renderer, RendererError};

/// Pixel format of an intermediate target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetFormat {
    Rgba8Unorm,
    #[default]
    Rgba16Float,
}

impl TargetFormat {
    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            TargetFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TargetFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        }
    }

    /// Bytes per texel.
    pub fn texel_size(self) -> u64 {
        match self {
            TargetFormat::Rgba8Unorm => 4,
            TargetFormat::Rgba16Float => 8,
        }
    }
}

/// Everything needed to (re)create a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TargetFormat,
}

impl TargetDescriptor {
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.texel_size()
    }

    /// Whether a target created from `self` can stand in for `other`.
    /// Labels are informational and never force a reallocation.
    fn matches(&self, other: &TargetDescriptor) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }
}

/// One half of the ping-pong pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PingPongSlot {
    A,
    B,
}

impl PingPongSlot {
    pub fn other(self) -> Self {
        match self {
            PingPongSlot::A => PingPongSlot::B,
            PingPongSlot::B => PingPongSlot::A,
        }
    }
}

/// Role of a pooled target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    PingPong(PingPongSlot),
    Custom(EffectId),
    Provided(Capabilities),
}

struct Entry<T> {
    descriptor: TargetDescriptor,
    target: T,
}

/// Explicitly owned pool of intermediate targets.
pub struct RenderTargetPool<T> {
    label: String,
    format: TargetFormat,
    width: u32,
    height: u32,
    pending_size: Option<(u32, u32)>,
    entries: HashMap<PoolKey, Entry<T>>,
}

impl<T> RenderTargetPool<T> {
    pub fn new(label: impl Into<String>, width: u32, height: u32, format: TargetFormat) -> Self {
        Self {
            label: label.into(),
            format,
            width: width.max(1),
            height: height.max(1),
            pending_size: None,
            entries: HashMap::new(),
        }
    }

    /// Current viewport size. A pending resize is not reflected until
    /// [`apply_pending_resize`](Self::apply_pending_resize).
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> TargetFormat {
        self.format
    }

    /// Record a new viewport size. Zero-sized requests (minimized windows)
    /// are ignored.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            tracing::debug!("Ignoring zero-sized resize to {width}x{height}");
            return;
        }
        self.pending_size = Some((width, height));
    }

    pub fn has_pending_resize(&self) -> bool {
        self.pending_size.is_some()
    }

    /// Adopt the pending size. Targets are reallocated by the next
    /// [`ensure`](Self::ensure) that sees a changed descriptor.
    pub fn apply_pending_resize(&mut self) -> bool {
        match self.pending_size.take() {
            Some(size) if size != (self.width, self.height) => {
                tracing::debug!(
                    "{}: viewport {}x{} -> {}x{}",
                    self.label,
                    self.width,
                    self.height,
                    size.0,
                    size.1
                );
                (self.width, self.height) = size;
                true
            }
            _ => false,
        }
    }

    /// Descriptor a target in `key`'s role should have right now.
    ///
    /// `scale` only applies to custom targets. Provided targets are always
    /// `Rgba16Float`: velocities are signed and a unorm target clamps them.
    pub fn descriptor_for(&self, key: &PoolKey, scale: f32) -> TargetDescriptor {
        let (width, height) = match key {
            PoolKey::Custom(_) => {
                let scaled = |v: u32| ((v as f32 * scale).round() as u32).max(1);
                (scaled(self.width), scaled(self.height))
            }
            _ => (self.width, self.height),
        };
        let role = match key {
            PoolKey::PingPong(slot) => format!("Ping-Pong {slot:?}"),
            PoolKey::Custom(id) => format!("Custom [{id}]"),
            PoolKey::Provided(cap) => format!("Provided {cap:?}"),
        };
        let format = match key {
            PoolKey::Provided(_) => TargetFormat::Rgba16Float,
            _ => self.format,
        };
        TargetDescriptor {
            label: format!("{} {role}", self.label),
            width,
            height,
            format,
        }
    }

    /// Make sure a target matching `descriptor` exists for `key`, allocating
    /// or reallocating as needed. Returns whether an allocation happened.
    pub fn ensure<R>(
        &mut self,
        renderer: &mut R,
        key: PoolKey,
        descriptor: TargetDescriptor,
    ) -> Result<bool, RendererError>
    where
        R: Renderer<Target = T>,
    {
        if let Some(entry) = self.entries.get(&key) {
            if entry.descriptor.matches(&descriptor) {
                return Ok(false);
            }
        }

        // free the stale target first so its memory is available to the new one
        if let Some(stale) = self.entries.remove(&key) {
            renderer.release_target(stale.target);
        }

        tracing::debug!(
            "Allocating {} ({}x{} {:?})",
            descriptor.label,
            descriptor.width,
            descriptor.height,
            descriptor.format
        );
        let target = renderer.create_target(&descriptor)?;
        self.entries.insert(key, Entry { descriptor, target });
        Ok(true)
    }

    pub fn get(&self, key: &PoolKey) -> Option<&T> {
        self.entries.get(key).map(|e| &e.target)
    }

    pub fn descriptor(&self, key: &PoolKey) -> Option<&TargetDescriptor> {
        self.entries.get(key).map(|e| &e.descriptor)
    }

    /// Release the target held for `key`, if any.
    pub fn release<R>(&mut self, renderer: &mut R, key: &PoolKey) -> bool
    where
        R: Renderer<Target = T>,
    {
        match self.entries.remove(key) {
            Some(entry) => {
                tracing::debug!("Releasing {}", entry.descriptor.label);
                renderer.release_target(entry.target);
                true
            }
            None => false,
        }
    }

    /// Release every target whose key fails `keep`.
    pub fn retain<R>(&mut self, renderer: &mut R, mut keep: impl FnMut(&PoolKey) -> bool)
    where
        R: Renderer<Target = T>,
    {
        let stale: Vec<PoolKey> = self.entries.keys().filter(|k| !keep(*k)).cloned().collect();
        for key in stale {
            self.release(renderer, &key);
        }
    }

    pub fn release_all<R>(&mut self, renderer: &mut R)
    where
        R: Renderer<Target = T>,
    {
        for (_, entry) in self.entries.drain() {
            renderer.release_target(entry.target);
        }
    }

    pub fn live_targets(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::software::{SoftwareRenderer, SoftwareTarget};

    fn pool() -> RenderTargetPool<SoftwareTarget> {
        RenderTargetPool::new("Test", 64, 32, TargetFormat::Rgba8Unorm)
    }

    #[test]
    fn ensure_reuses_matching_targets() {
        let mut renderer = SoftwareRenderer::new();
        let mut pool = pool();
        let key = PoolKey::PingPong(PingPongSlot::A);

        let desc = pool.descriptor_for(&key, 1.0);
        assert!(pool.ensure(&mut renderer, key.clone(), desc.clone()).unwrap());
        assert!(!pool.ensure(&mut renderer, key.clone(), desc).unwrap());
        assert_eq!(renderer.live_targets(), 1);
    }

    #[test]
    fn resize_is_lazy() {
        let mut renderer = SoftwareRenderer::new();
        let mut pool = pool();
        let key = PoolKey::PingPong(PingPongSlot::B);
        let desc = pool.descriptor_for(&key, 1.0);
        pool.ensure(&mut renderer, key.clone(), desc).unwrap();

        pool.request_resize(128, 64);
        assert_eq!(pool.size(), (64, 32));
        assert!(pool.apply_pending_resize());

        let desc = pool.descriptor_for(&key, 1.0);
        assert!(pool.ensure(&mut renderer, key.clone(), desc).unwrap());
        assert_eq!(pool.descriptor(&key).map(|d| d.width), Some(128));
        assert_eq!(renderer.live_targets(), 1);
    }

    #[test]
    fn zero_resize_is_ignored() {
        let mut pool = pool();
        pool.request_resize(0, 720);
        assert!(!pool.has_pending_resize());
    }

    #[test]
    fn custom_targets_are_scaled() {
        let pool = pool();
        let desc = pool.descriptor_for(&PoolKey::Custom(EffectId::new("bloom")), 0.5);
        assert_eq!((desc.width, desc.height), (32, 16));
        assert!(desc.label.contains("bloom"));
    }

    #[test]
    fn provided_targets_keep_signed_values() {
        let pool = pool();
        let velocity = pool.descriptor_for(&PoolKey::Provided(Capabilities::VELOCITY), 1.0);
        assert_eq!(velocity.format, TargetFormat::Rgba16Float);
        assert_eq!((velocity.width, velocity.height), (64, 32));

        let ping = pool.descriptor_for(&PoolKey::PingPong(PingPongSlot::A), 1.0);
        assert_eq!(ping.format, TargetFormat::Rgba8Unorm);
    }

    #[test]
    fn release_all_frees_everything() {
        let mut renderer = SoftwareRenderer::new();
        let mut pool = pool();
        for key in [
            PoolKey::PingPong(PingPongSlot::A),
            PoolKey::PingPong(PingPongSlot::B),
            PoolKey::Provided(Capabilities::VELOCITY),
        ] {
            let desc = pool.descriptor_for(&key, 1.0);
            pool.ensure(&mut renderer, key, desc).unwrap();
        }
        assert_eq!(renderer.live_targets(), 3);

        pool.release_all(&mut renderer);
        assert_eq!(pool.live_targets(), 0);
        assert_eq!(renderer.live_targets(), 0);
    }
}
