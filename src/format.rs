//! Pixel format table.
//!
//! Maps decoder pixel formats to the Vulkan formats that hold them. Multi-planar YUV formats
//! live in a single image with one aspect per plane; when the device cannot create the
//! multi-planar format, every plane can instead be stored in its own image using the per-plane
//! fallback formats.
//!
//! The table is only consulted to pick barrier aspect masks and plane sizes. It carries no
//! synchronization state.

use ash::vk;
use glam::UVec2;
use serde::{Deserialize, Serialize};

/// Decoder-side pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PixelFormat {
    Gray8,
    Gray10,
    Gray12,
    Gray16,
    GrayF32,

    Bgra,
    Rgba,
    Rgb24,
    Bgr24,
    Rgb48,
    Rgba64,
    Bgr0,
    Rgb0,
    X2Rgb10,
    X2Bgr10,
    RgbaF32,

    Gbrp,
    Gbrp10,
    Gbrp12,
    Gbrp16,
    GbrpF32,
    Gbrap,
    Gbrap16,

    Nv12,
    P010,
    P012,
    P016,
    Nv16,
    P210,
    P212,
    P216,
    Nv24,
    P410,
    P412,
    P416,

    Yuv420p,
    Yuv420p10,
    Yuv420p12,
    Yuv420p16,
    Yuv422p,
    Yuv422p10,
    Yuv422p12,
    Yuv422p16,
    Yuv444p,
    Yuv444p10,
    Yuv444p12,
    Yuv444p16,

    Yuyv422,
    Uyvy422,
    Y210,
    Y212,

    Yuva420p,
    Yuva444p,
}

/// One row of the format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    /// The (possibly multi-planar) format of the image.
    pub format: vk::Format,
    pub pixel_format: PixelFormat,
    /// Aspect covering all planes of the image.
    pub aspect: vk::ImageAspectFlags,
    /// Number of planes.
    pub planes: u32,
    /// Number of images the planes are stored in.
    pub images: u32,
    /// One format per plane for storing each plane in its own image.
    pub fallbacks: &'static [vk::Format],
}

const ASPECT_2PLANE: vk::ImageAspectFlags = vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::PLANE_0.as_raw() | vk::ImageAspectFlags::PLANE_1.as_raw(),
);
const ASPECT_3PLANE: vk::ImageAspectFlags = vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::PLANE_0.as_raw()
        | vk::ImageAspectFlags::PLANE_1.as_raw()
        | vk::ImageAspectFlags::PLANE_2.as_raw(),
);
const COLOR: vk::ImageAspectFlags = vk::ImageAspectFlags::COLOR;

const R8: vk::Format = vk::Format::R8_UNORM;
const R8G8: vk::Format = vk::Format::R8G8_UNORM;
const R16: vk::Format = vk::Format::R16_UNORM;
const R16G16: vk::Format = vk::Format::R16G16_UNORM;
const R32F: vk::Format = vk::Format::R32_SFLOAT;

const fn single(
    format: vk::Format,
    pixel_format: PixelFormat,
    fallbacks: &'static [vk::Format],
) -> VideoFormat {
    VideoFormat {
        format,
        pixel_format,
        aspect: COLOR,
        planes: 1,
        images: 1,
        fallbacks,
    }
}

const fn separate(
    format: vk::Format,
    pixel_format: PixelFormat,
    fallbacks: &'static [vk::Format],
) -> VideoFormat {
    VideoFormat {
        format,
        pixel_format,
        aspect: COLOR,
        planes: fallbacks.len() as u32,
        images: fallbacks.len() as u32,
        fallbacks,
    }
}

const fn two_plane(format: vk::Format, pixel_format: PixelFormat, wide: bool) -> VideoFormat {
    VideoFormat {
        format,
        pixel_format,
        aspect: ASPECT_2PLANE,
        planes: 2,
        images: 1,
        fallbacks: if wide { &[R16, R16G16] } else { &[R8, R8G8] },
    }
}

const fn three_plane(format: vk::Format, pixel_format: PixelFormat, wide: bool) -> VideoFormat {
    VideoFormat {
        format,
        pixel_format,
        aspect: ASPECT_3PLANE,
        planes: 3,
        images: 1,
        fallbacks: if wide { &[R16, R16, R16] } else { &[R8, R8, R8] },
    }
}

use PixelFormat::*;

#[rustfmt::skip]
static FORMATS: &[VideoFormat] = &[
    // Gray
    single(R8, Gray8, &[R8]),
    single(R16, Gray10, &[R16]),
    single(R16, Gray12, &[R16]),
    single(R16, Gray16, &[R16]),
    single(R32F, GrayF32, &[R32F]),

    // Packed RGB
    single(vk::Format::B8G8R8A8_UNORM, Bgra, &[vk::Format::B8G8R8A8_UNORM]),
    single(vk::Format::R8G8B8A8_UNORM, Rgba, &[vk::Format::R8G8B8A8_UNORM]),
    single(vk::Format::R8G8B8_UNORM, Rgb24, &[vk::Format::R8G8B8_UNORM]),
    single(vk::Format::B8G8R8_UNORM, Bgr24, &[vk::Format::B8G8R8_UNORM]),
    single(vk::Format::R16G16B16_UNORM, Rgb48, &[vk::Format::R16G16B16_UNORM]),
    single(vk::Format::R16G16B16A16_UNORM, Rgba64, &[vk::Format::R16G16B16A16_UNORM]),
    single(vk::Format::B8G8R8A8_UNORM, Bgr0, &[vk::Format::B8G8R8A8_UNORM]),
    single(vk::Format::R8G8B8A8_UNORM, Rgb0, &[vk::Format::R8G8B8A8_UNORM]),
    single(vk::Format::A2R10G10B10_UNORM_PACK32, X2Rgb10, &[vk::Format::A2R10G10B10_UNORM_PACK32]),
    single(vk::Format::A2B10G10R10_UNORM_PACK32, X2Bgr10, &[vk::Format::A2B10G10R10_UNORM_PACK32]),
    single(vk::Format::R32G32B32A32_SFLOAT, RgbaF32, &[vk::Format::R32G32B32A32_SFLOAT]),

    // Planar RGB, one image per plane
    separate(R8, Gbrp, &[R8, R8, R8]),
    separate(R16, Gbrp10, &[R16, R16, R16]),
    separate(R16, Gbrp12, &[R16, R16, R16]),
    separate(R16, Gbrp16, &[R16, R16, R16]),
    separate(R32F, GbrpF32, &[R32F, R32F, R32F]),
    separate(R8, Gbrap, &[R8, R8, R8, R8]),
    separate(R16, Gbrap16, &[R16, R16, R16, R16]),

    // Two-plane YUV
    two_plane(vk::Format::G8_B8R8_2PLANE_420_UNORM, Nv12, false),
    two_plane(vk::Format::G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16, P010, true),
    two_plane(vk::Format::G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16, P012, true),
    two_plane(vk::Format::G16_B16R16_2PLANE_420_UNORM, P016, true),
    two_plane(vk::Format::G8_B8R8_2PLANE_422_UNORM, Nv16, false),
    two_plane(vk::Format::G10X6_B10X6R10X6_2PLANE_422_UNORM_3PACK16, P210, true),
    two_plane(vk::Format::G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16, P212, true),
    two_plane(vk::Format::G16_B16R16_2PLANE_422_UNORM, P216, true),
    two_plane(vk::Format::G8_B8R8_2PLANE_444_UNORM, Nv24, false),
    two_plane(vk::Format::G10X6_B10X6R10X6_2PLANE_444_UNORM_3PACK16, P410, true),
    two_plane(vk::Format::G12X4_B12X4R12X4_2PLANE_444_UNORM_3PACK16, P412, true),
    two_plane(vk::Format::G16_B16R16_2PLANE_444_UNORM, P416, true),

    // Three-plane YUV
    three_plane(vk::Format::G8_B8_R8_3PLANE_420_UNORM, Yuv420p, false),
    three_plane(vk::Format::G16_B16_R16_3PLANE_420_UNORM, Yuv420p10, true),
    three_plane(vk::Format::G16_B16_R16_3PLANE_420_UNORM, Yuv420p12, true),
    three_plane(vk::Format::G16_B16_R16_3PLANE_420_UNORM, Yuv420p16, true),
    three_plane(vk::Format::G8_B8_R8_3PLANE_422_UNORM, Yuv422p, false),
    three_plane(vk::Format::G16_B16_R16_3PLANE_422_UNORM, Yuv422p10, true),
    three_plane(vk::Format::G16_B16_R16_3PLANE_422_UNORM, Yuv422p12, true),
    three_plane(vk::Format::G16_B16_R16_3PLANE_422_UNORM, Yuv422p16, true),
    three_plane(vk::Format::G8_B8_R8_3PLANE_444_UNORM, Yuv444p, false),
    three_plane(vk::Format::G16_B16_R16_3PLANE_444_UNORM, Yuv444p10, true),
    three_plane(vk::Format::G16_B16_R16_3PLANE_444_UNORM, Yuv444p12, true),
    three_plane(vk::Format::G16_B16_R16_3PLANE_444_UNORM, Yuv444p16, true),

    // Packed 4:2:2
    single(vk::Format::G8B8G8R8_422_UNORM, Yuyv422, &[vk::Format::R8G8B8A8_UNORM]),
    single(vk::Format::B8G8R8G8_422_UNORM, Uyvy422, &[vk::Format::R8G8B8A8_UNORM]),
    single(vk::Format::G10X6B10X6G10X6R10X6_422_UNORM_4PACK16, Y210, &[vk::Format::R16G16B16A16_UNORM]),
    single(vk::Format::G12X4B12X4G12X4R12X4_422_UNORM_4PACK16, Y212, &[vk::Format::R16G16B16A16_UNORM]),

    // Planar YUV + alpha
    separate(R8, Yuva420p, &[R8, R8, R8, R8]),
    separate(R8, Yuva444p, &[R8, R8, R8, R8]),
];

impl PixelFormat {
    /// Looks up the table row for this pixel format.
    pub fn video_format(self) -> crate::Result<&'static VideoFormat> {
        FORMATS
            .iter()
            .find(|entry| entry.pixel_format == self)
            .ok_or(crate::Error::UnsupportedFormat(self))
    }

    /// Horizontal and vertical chroma subsampling, as right shifts.
    pub fn chroma_shift(self) -> UVec2 {
        match self {
            Nv12 | P010 | P012 | P016 | Yuv420p | Yuv420p10 | Yuv420p12 | Yuv420p16 | Yuva420p => {
                UVec2::new(1, 1)
            }
            Nv16 | P210 | P212 | P216 | Yuv422p | Yuv422p10 | Yuv422p12 | Yuv422p16 | Yuyv422
            | Uyvy422 | Y210 | Y212 => UVec2::new(1, 0),
            _ => UVec2::ZERO,
        }
    }
}

/// Looks up a table row by Vulkan format. Where several pixel formats share a Vulkan format
/// the first row wins.
pub fn video_format_for(format: vk::Format) -> Option<&'static VideoFormat> {
    FORMATS.iter().find(|entry| entry.format == format)
}

/// All known formats, in table order.
pub fn all_formats() -> &'static [VideoFormat] {
    FORMATS
}

impl VideoFormat {
    /// `true` if all planes share one multi-planar image.
    pub fn is_multiplanar(&self) -> bool {
        self.images == 1 && self.planes > 1
    }

    /// The aspect a barrier on plane `index` must name.
    ///
    /// For multi-planar images this is the plane's own aspect; planes stored in separate images
    /// are plain colour images.
    pub fn plane_aspect(&self, index: u32) -> vk::ImageAspectFlags {
        assert!(index < self.planes, "Plane {index} out of range");
        if !self.is_multiplanar() {
            return COLOR;
        }
        match index {
            0 => vk::ImageAspectFlags::PLANE_0,
            1 => vk::ImageAspectFlags::PLANE_1,
            _ => vk::ImageAspectFlags::PLANE_2,
        }
    }

    /// Size of plane `index` of a frame with the given luma extent, in texels of the fallback
    /// format.
    pub fn plane_extent(&self, index: u32, extent: UVec2) -> UVec2 {
        let shift = self.pixel_format.chroma_shift();
        let packed_422 = self.planes == 1 && shift.x > 0;
        let subsampled = packed_422 || (index > 0 && index < 3 && self.planes >= 3)
            || (index == 1 && self.planes == 2);
        if !subsampled {
            return extent;
        }
        let shift = if packed_422 { UVec2::new(1, 0) } else { shift };
        UVec2::new(
            (extent.x + (1 << shift.x) - 1) >> shift.x,
            (extent.y + (1 << shift.y) - 1) >> shift.y,
        )
    }

    /// Bytes needed to store plane `index` tightly packed.
    pub fn plane_size(&self, index: u32, extent: UVec2) -> u64 {
        let plane = self.plane_extent(index, extent);
        let texel = texel_size(self.fallbacks[index as usize]);
        plane.x as u64 * plane.y as u64 * texel as u64
    }
}

/// Bytes per texel of the single-plane formats used as fallbacks.
pub fn texel_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_UNORM => 2,
        vk::Format::R8G8B8_UNORM | vk::Format::B8G8R8_UNORM => 3,
        vk::Format::R16G16_UNORM
        | vk::Format::R32_SFLOAT
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::A2R10G10B10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UNORM_PACK32 => 4,
        vk::Format::R16G16B16_UNORM => 6,
        vk::Format::R16G16B16A16_UNORM => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => unreachable!("{format:?} is not a fallback format"),
    }
}
