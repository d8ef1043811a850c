use tessel::ash::vk;

///Rendering extent of a producer subtree. Set once per frame by a producer and read by every descendant that
/// needs to know where it renders to.
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub size: vk::Extent2D,
    pub offset: vk::Offset2D,
    pub rect: vk::Rect2D,
    pub viewport: vk::Viewport,
}

impl Viewport {
    pub fn new(offset: vk::Offset2D, size: vk::Extent2D) -> Self {
        Viewport {
            size,
            offset,
            rect: vk::Rect2D {
                offset,
                extent: size,
            },
            viewport: vk::Viewport {
                x: offset.x as f32,
                y: offset.y as f32,
                width: size.width as f32,
                height: size.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        }
    }

    ///Viewport that covers `extent`, starting at the origin.
    pub fn from_extent(extent: vk::Extent2D) -> Self {
        Self::new(vk::Offset2D::default(), extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_matches_viewport() {
        let vp = Viewport::new(
            vk::Offset2D { x: 10, y: 20 },
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        );
        assert_eq!(vp.rect.offset.x, 10);
        assert_eq!(vp.rect.extent.height, 480);
        assert_eq!(vp.viewport.y, 20.0);
        assert_eq!(vp.viewport.width, 640.0);
        assert_eq!(vp.viewport.max_depth, 1.0);
    }
}
