//! Producers publish images and buffers under a [ResourceId]. Consumers import them later in the same frame.
//!
//! An export is either [Constant](ExportMode::Constant), which can be written once per frame, or
//! [Versioned](ExportMode::Versioned). Re-exporting a versioned resource moves the previous entry to a
//! [specialized](ResourceId::specialize) key, so consumers that pinned an older [Version] still find it.
//!
//! Imports *borrow* the resource. The importer states in which layout/access/stage it leaves the resource, and that
//! state is written back into the table. The next importer (or end-of-frame barrier insertion) therefore always sees
//! the state the resource is actually in.

use crate::ExchangeError;
use ahash::AHashMap;
use std::fmt::Display;
use tessel::ash::vk;
use xxhash_rust::const_xxh3::{xxh3_64, xxh3_64_with_seed};

///Logical id of an exported resource. Usually created from a name at compile time.
///
/// ```
/// # use tessel_graph::ResourceId;
/// const GBUFFER_ALBEDO: ResourceId = ResourceId::new("gbuffer.albedo");
/// assert_ne!(GBUFFER_ALBEDO, GBUFFER_ALBEDO.specialize(0));
/// ```
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub const fn new(name: &str) -> Self {
        ResourceId(xxh3_64(name.as_bytes()))
    }

    ///Key under which `version` of this resource is kept once a newer version was exported.
    pub const fn specialize(self, version: u32) -> Self {
        ResourceId(xxh3_64_with_seed(&version.to_le_bytes(), self.0))
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceId({:#x})", self.0)
    }
}

#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy)]
pub enum ExportMode {
    ///Written once per frame.
    Constant,
    ///Can be superseded. Older versions stay importable.
    Versioned,
}

#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum Version {
    #[default]
    Latest,
    Exact(u32),
}

///Layout, access and stage an image is in.
#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
    pub stage: vk::PipelineStageFlags2,
}

impl ImageState {
    pub fn new(
        layout: vk::ImageLayout,
        access: vk::AccessFlags2,
        stage: vk::PipelineStageFlags2,
    ) -> Self {
        ImageState {
            layout,
            access,
            stage,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExportedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub subresource_range: vk::ImageSubresourceRange,
    ///State the image is in when imported.
    pub state: ImageState,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportedBuffer {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub access: vk::AccessFlags2,
    pub stage: vk::PipelineStageFlags2,
}

#[derive(Debug, Clone, Copy)]
pub enum ExportedResource {
    Image(ExportedImage),
    Buffer(ExportedBuffer),
}

impl From<ExportedImage> for ExportedResource {
    fn from(value: ExportedImage) -> Self {
        ExportedResource::Image(value)
    }
}

impl From<ExportedBuffer> for ExportedResource {
    fn from(value: ExportedBuffer) -> Self {
        ExportedResource::Buffer(value)
    }
}

struct ExportEntry {
    mode: ExportMode,
    version: u32,
    resource: ExportedResource,
}

#[derive(Default)]
pub struct ResourceExchange {
    entries: AHashMap<ResourceId, ExportEntry>,
}

impl ResourceExchange {
    pub fn new() -> Self {
        Self::default()
    }

    ///Exports `resource` under `id`. Returns the version the resource is importable as.
    pub fn export(
        &mut self,
        id: ResourceId,
        resource: impl Into<ExportedResource>,
        mode: ExportMode,
    ) -> Result<u32, ExchangeError> {
        let resource = resource.into();
        let version = match (self.entries.get(&id).map(|e| e.mode), mode) {
            (None, _) => 0,
            (Some(ExportMode::Constant), ExportMode::Constant) => {
                return Err(ExchangeError::ConstantReexport(id));
            }
            (Some(ExportMode::Constant), ExportMode::Versioned) => {
                return Err(ExchangeError::VersionedOverConstant(id));
            }
            (Some(ExportMode::Versioned), ExportMode::Constant) => {
                return Err(ExchangeError::ConstantOverVersioned(id));
            }
            (Some(ExportMode::Versioned), ExportMode::Versioned) => {
                //move the superseded version out of the way
                let Some(previous) = self.entries.remove(&id) else {
                    return Err(ExchangeError::NoSuchResource(id));
                };
                let next = previous.version + 1;
                self.entries
                    .insert(id.specialize(previous.version), previous);
                next
            }
        };

        self.entries.insert(
            id,
            ExportEntry {
                mode,
                version,
                resource,
            },
        );
        Ok(version)
    }

    pub fn can_import(&self, id: ResourceId) -> bool {
        self.entries.contains_key(&id)
    }

    ///Latest version of `id` that can be imported.
    pub fn importable_version(&self, id: ResourceId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.version)
    }

    ///Resolves the key `version` of `id` is stored under.
    fn resolve(&self, id: ResourceId, version: Version) -> Result<ResourceId, ExchangeError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(ExchangeError::NoSuchResource(id))?;
        match version {
            Version::Latest => Ok(id),
            Version::Exact(v) if v == entry.version => Ok(id),
            Version::Exact(v) => {
                let specialized = id.specialize(v);
                if self.entries.contains_key(&specialized) {
                    Ok(specialized)
                } else {
                    Err(ExchangeError::NoSuchVersion { id, version: v })
                }
            }
        }
    }

    ///Imports `version` of image `id`. The returned image carries the state it is currently in. `final_state` is
    /// the state the caller leaves the image in.
    pub fn import_image(
        &mut self,
        id: ResourceId,
        version: Version,
        final_state: ImageState,
    ) -> Result<ExportedImage, ExchangeError> {
        let key = self.resolve(id, version)?;
        match self.entries.get_mut(&key).map(|e| &mut e.resource) {
            Some(ExportedResource::Image(img)) => {
                let found = *img;
                img.state = final_state;
                Ok(found)
            }
            Some(ExportedResource::Buffer(_)) => Err(ExchangeError::TypeMismatch {
                id,
                expected: "image",
            }),
            None => Err(ExchangeError::NoSuchResource(id)),
        }
    }

    ///Imports `version` of buffer `id`. Like [import_image](Self::import_image), the stored access and stage are
    /// replaced by the final ones.
    pub fn import_buffer(
        &mut self,
        id: ResourceId,
        version: Version,
        final_access: vk::AccessFlags2,
        final_stage: vk::PipelineStageFlags2,
    ) -> Result<ExportedBuffer, ExchangeError> {
        let key = self.resolve(id, version)?;
        match self.entries.get_mut(&key).map(|e| &mut e.resource) {
            Some(ExportedResource::Buffer(buf)) => {
                let found = *buf;
                buf.access = final_access;
                buf.stage = final_stage;
                Ok(found)
            }
            Some(ExportedResource::Image(_)) => Err(ExchangeError::TypeMismatch {
                id,
                expected: "buffer",
            }),
            None => Err(ExchangeError::NoSuchResource(id)),
        }
    }

    ///Number of stored entries, including superseded versions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel::ash::vk::Handle;

    const COLOR: ResourceId = ResourceId::new("color");
    const VERTICES: ResourceId = ResourceId::new("vertices");

    fn image(raw: u64) -> ExportedImage {
        ExportedImage {
            image: vk::Image::from_raw(raw),
            view: vk::ImageView::from_raw(raw),
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            subresource_range: vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
            state: ImageState::new(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ),
        }
    }

    fn buffer(raw: u64) -> ExportedBuffer {
        ExportedBuffer {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
            size: 1024,
            access: vk::AccessFlags2::TRANSFER_WRITE,
            stage: vk::PipelineStageFlags2::COPY,
        }
    }

    fn shader_read() -> ImageState {
        ImageState::new(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        )
    }

    #[test]
    fn versions_stay_importable() {
        let mut ex = ResourceExchange::new();
        for raw in 1..=4 {
            let v = ex.export(COLOR, image(raw), ExportMode::Versioned).unwrap();
            assert_eq!(v as u64, raw - 1);
        }
        assert_eq!(ex.importable_version(COLOR), Some(3));

        for k in 0..3u32 {
            let img = ex
                .import_image(COLOR, Version::Exact(k), shader_read())
                .unwrap();
            assert_eq!(img.image, vk::Image::from_raw(k as u64 + 1));
        }
        let latest = ex
            .import_image(COLOR, Version::Latest, shader_read())
            .unwrap();
        assert_eq!(latest.image, vk::Image::from_raw(4));
        assert_eq!(
            ex.import_image(COLOR, Version::Exact(3), shader_read())
                .unwrap()
                .image,
            vk::Image::from_raw(4)
        );
        assert_eq!(
            ex.import_image(COLOR, Version::Exact(7), shader_read())
                .unwrap_err(),
            ExchangeError::NoSuchVersion {
                id: COLOR,
                version: 7
            }
        );
    }

    #[test]
    fn export_mode_conflicts() {
        let mut ex = ResourceExchange::new();
        ex.export(VERTICES, buffer(1), ExportMode::Constant).unwrap();
        assert_eq!(
            ex.export(VERTICES, buffer(2), ExportMode::Constant),
            Err(ExchangeError::ConstantReexport(VERTICES))
        );
        assert_eq!(
            ex.export(VERTICES, buffer(2), ExportMode::Versioned),
            Err(ExchangeError::VersionedOverConstant(VERTICES))
        );

        ex.export(COLOR, image(1), ExportMode::Versioned).unwrap();
        assert_eq!(
            ex.export(COLOR, image(2), ExportMode::Constant),
            Err(ExchangeError::ConstantOverVersioned(COLOR))
        );
        //failed exports do not touch the table
        assert_eq!(ex.len(), 2);
        assert_eq!(ex.importable_version(COLOR), Some(0));
    }

    #[test]
    fn import_hands_back_state() {
        let mut ex = ResourceExchange::new();
        ex.export(COLOR, image(1), ExportMode::Constant).unwrap();

        let first = ex
            .import_image(COLOR, Version::Latest, shader_read())
            .unwrap();
        assert_eq!(
            first.state.layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        let second = ex
            .import_image(COLOR, Version::Exact(0), ImageState::default())
            .unwrap();
        assert_eq!(second.state, shader_read());
        let third = ex
            .import_image(COLOR, Version::Latest, shader_read())
            .unwrap();
        assert_eq!(third.state, ImageState::default());
    }

    #[test]
    fn pinned_import_updates_specialized_entry() {
        let mut ex = ResourceExchange::new();
        ex.export(COLOR, image(1), ExportMode::Versioned).unwrap();
        ex.export(COLOR, image(2), ExportMode::Versioned).unwrap();

        ex.import_image(COLOR, Version::Exact(0), shader_read())
            .unwrap();

        //the old version changed state, the latest one did not
        let old = ex
            .import_image(COLOR, Version::Exact(0), shader_read())
            .unwrap();
        assert_eq!(old.state, shader_read());
        let latest = ex
            .import_image(COLOR, Version::Latest, shader_read())
            .unwrap();
        assert_eq!(
            latest.state.layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn ids_are_const_and_distinct() {
        const SAME: ResourceId = ResourceId::new("color");
        assert_eq!(SAME, COLOR);
        assert_ne!(COLOR, VERTICES);
        assert_ne!(COLOR.specialize(0), COLOR.specialize(1));
        assert_ne!(COLOR.specialize(0), VERTICES.specialize(0));
        assert_eq!(COLOR.specialize(3), ResourceId::new("color").specialize(3));
    }

    #[test]
    fn type_mismatch_and_missing() {
        let mut ex = ResourceExchange::new();
        ex.export(VERTICES, buffer(1), ExportMode::Constant).unwrap();
        assert_eq!(
            ex.import_image(VERTICES, Version::Latest, shader_read())
                .unwrap_err(),
            ExchangeError::TypeMismatch {
                id: VERTICES,
                expected: "image"
            }
        );
        assert_eq!(
            ex.import_buffer(
                COLOR,
                Version::Latest,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::NONE
            )
            .unwrap_err(),
            ExchangeError::NoSuchResource(COLOR)
        );

        let buf = ex
            .import_buffer(
                VERTICES,
                Version::Latest,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            )
            .unwrap();
        assert_eq!(buf.access, vk::AccessFlags2::TRANSFER_WRITE);
        assert!(ex.can_import(VERTICES));

        ex.clear();
        assert!(!ex.can_import(VERTICES));
        assert!(ex.is_empty());
    }
}
