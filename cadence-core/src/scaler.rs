// SOFTWARE SCALER - YUV/RGB to packed display pixels
//
// Decoders output YUV (typically YUV420P or NV12), sometimes packed RGB.
// Display surfaces want packed 4-byte pixels in their own channel order.
// This is the CPU conversion context used when the embedding application
// does not bring its own.
//
// Sampling is point (nearest) at 1:1 size; chroma is shared by each 2x2
// block of luma.

use crate::convert::{ChannelOrder, ConversionKey, ConvertError, Scaler, ScalerFactory, BYTES_PER_PIXEL};
use crate::decode::{DecodedFrame, PixelFormat};

// ============================================================================
// Color Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    /// SD (NTSC/PAL)
    Bt601,
    /// HD
    #[default]
    Bt709,
    /// UHD
    Bt2020,
}

impl ColorSpace {
    /// Returns (Wr, Wb) where Wg = 1 - Wr - Wb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::Bt601 => (0.299, 0.114),
            Self::Bt709 => (0.2126, 0.0722),
            Self::Bt2020 => (0.2627, 0.0593),
        }
    }

    /// Full YUV to RGB matrix
    pub fn yuv_to_rgb_matrix(&self) -> [[f32; 3]; 3] {
        let (wr, wb) = self.coefficients();
        let wg = 1.0 - wr - wb;

        // R = Y + 2*(1-Wr)*Cr
        // G = Y - 2*Wb*(1-Wb)/Wg*Cb - 2*Wr*(1-Wr)/Wg*Cr
        // B = Y + 2*(1-Wb)*Cb
        let cr_r = 2.0 * (1.0 - wr);
        let cb_g = -2.0 * wb * (1.0 - wb) / wg;
        let cr_g = -2.0 * wr * (1.0 - wr) / wg;
        let cb_b = 2.0 * (1.0 - wb);

        [[1.0, 0.0, cr_r], [1.0, cb_g, cr_g], [1.0, cb_b, 0.0]]
    }

    /// Conventional choice by picture height
    pub fn for_height(height: u32) -> Self {
        if height >= 2160 {
            Self::Bt2020
        } else if height > 576 {
            Self::Bt709
        } else {
            Self::Bt601
        }
    }
}

// ============================================================================
// Lookup tables
// ============================================================================

/// Fixed-point YUV contributions, pre-computed per 8-bit code value
struct YuvTables {
    y: [i32; 256],
    u_g: [i32; 256],
    u_b: [i32; 256],
    v_r: [i32; 256],
    v_g: [i32; 256],
}

impl YuvTables {
    fn new(color_space: ColorSpace) -> Self {
        let matrix = color_space.yuv_to_rgb_matrix();
        let mut t = Self {
            y: [0; 256],
            u_g: [0; 256],
            u_b: [0; 256],
            v_r: [0; 256],
            v_g: [0; 256],
        };

        for i in 0..256 {
            let y = (i as i32) - 16; // Y range: 16-235
            let uv = (i as i32) - 128; // U/V centered at 128

            // 298/256 ≈ 1.164 scales 16-235 to 0-255
            t.y[i] = (y * 298) >> 8;
            t.u_g[i] = (uv as f32 * matrix[1][1] * 256.0) as i32;
            t.u_b[i] = (uv as f32 * matrix[2][1] * 256.0) as i32;
            t.v_r[i] = (uv as f32 * matrix[0][2] * 256.0) as i32;
            t.v_g[i] = (uv as f32 * matrix[1][2] * 256.0) as i32;
        }
        t
    }

    #[inline]
    fn rgb(&self, y: u8, u: u8, v: u8) -> (u8, u8, u8) {
        let (y, u, v) = (y as usize, u as usize, v as usize);
        let luma = self.y[y];
        let r = (luma + (self.v_r[v] >> 8)).clamp(0, 255) as u8;
        let g = (luma + (self.u_g[u] >> 8) + (self.v_g[v] >> 8)).clamp(0, 255) as u8;
        let b = (luma + (self.u_b[u] >> 8)).clamp(0, 255) as u8;
        (r, g, b)
    }
}

// ============================================================================
// Scaler
// ============================================================================

pub struct SoftwareScaler {
    key: ConversionKey,
    offsets: [usize; 4],
    tables: YuvTables,
}

impl SoftwareScaler {
    pub fn new(key: ConversionKey, order: ChannelOrder, color_space: ColorSpace) -> Self {
        Self {
            key,
            offsets: order.offsets(),
            tables: YuvTables::new(color_space),
        }
    }

    #[inline]
    fn put(&self, dst: &mut [u8], idx: usize, r: u8, g: u8, b: u8, a: u8) {
        let [ro, go, bo, ao] = self.offsets;
        dst[idx + ro] = r;
        dst[idx + go] = g;
        dst[idx + bo] = b;
        dst[idx + ao] = a;
    }

    fn yuv420p(&self, src: &DecodedFrame, dst: &mut [u8], stride: usize) {
        let (y_plane, u_plane, v_plane) = (&src.planes[0], &src.planes[1], &src.planes[2]);
        let (w, h) = (src.width as usize, src.height as usize);

        for row in 0..h {
            let y_row = row * y_plane.stride;
            let u_row = (row / 2) * u_plane.stride;
            let v_row = (row / 2) * v_plane.stride;
            let dst_row = row * stride;

            for x in 0..w {
                let (r, g, b) = self.tables.rgb(
                    y_plane.data[y_row + x],
                    u_plane.data[u_row + x / 2],
                    v_plane.data[v_row + x / 2],
                );
                self.put(dst, dst_row + x * BYTES_PER_PIXEL, r, g, b, 255);
            }
        }
    }

    fn nv12(&self, src: &DecodedFrame, dst: &mut [u8], stride: usize) {
        let (y_plane, uv_plane) = (&src.planes[0], &src.planes[1]);
        let (w, h) = (src.width as usize, src.height as usize);

        for row in 0..h {
            let y_row = row * y_plane.stride;
            let uv_row = (row / 2) * uv_plane.stride;
            let dst_row = row * stride;

            for x in 0..w {
                let uv = uv_row + (x / 2) * 2;
                let (r, g, b) = self.tables.rgb(
                    y_plane.data[y_row + x],
                    uv_plane.data[uv],
                    uv_plane.data[uv + 1],
                );
                self.put(dst, dst_row + x * BYTES_PER_PIXEL, r, g, b, 255);
            }
        }
    }

    fn packed(&self, src: &DecodedFrame, dst: &mut [u8], stride: usize) {
        let plane = &src.planes[0];
        let (w, h) = (src.width as usize, src.height as usize);

        for row in 0..h {
            let src_row = row * plane.stride;
            let dst_row = row * stride;

            for x in 0..w {
                let (r, g, b, a) = match src.format {
                    PixelFormat::Rgb24 => {
                        let p = &plane.data[src_row + x * 3..src_row + x * 3 + 3];
                        (p[0], p[1], p[2], 255)
                    }
                    PixelFormat::Bgra => {
                        let p = &plane.data[src_row + x * 4..src_row + x * 4 + 4];
                        (p[2], p[1], p[0], p[3])
                    }
                    _ => {
                        let p = &plane.data[src_row + x * 4..src_row + x * 4 + 4];
                        (p[0], p[1], p[2], p[3])
                    }
                };
                self.put(dst, dst_row + x * BYTES_PER_PIXEL, r, g, b, a);
            }
        }
    }
}

impl Scaler for SoftwareScaler {
    fn scale(&mut self, src: &DecodedFrame, dst: &mut [u8], dst_stride: usize) -> Result<(), ConvertError> {
        if ConversionKey::of(src) != self.key {
            return Err(ConvertError::InvalidFrame(format!(
                "context built for {:?}, got {}x{} {:?}",
                self.key, src.width, src.height, src.format
            )));
        }
        src.validate()
            .map_err(|e| ConvertError::InvalidFrame(e.to_string()))?;

        let (w, h) = (src.width as usize, src.height as usize);
        let needed = if h == 0 { 0 } else { (h - 1) * dst_stride + w * BYTES_PER_PIXEL };
        if dst_stride < w * BYTES_PER_PIXEL || dst.len() < needed {
            return Err(ConvertError::InvalidFrame(format!(
                "destination holds {} bytes, {} needed",
                dst.len(),
                needed
            )));
        }

        match src.format {
            PixelFormat::Yuv420p => self.yuv420p(src, dst, dst_stride),
            PixelFormat::Nv12 => self.nv12(src, dst, dst_stride),
            PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => self.packed(src, dst, dst_stride),
        }
        Ok(())
    }
}

/// Builds [`SoftwareScaler`] contexts. With no fixed color space the matrix
/// is chosen from the picture height.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareScalerFactory {
    pub color_space: Option<ColorSpace>,
}

impl SoftwareScalerFactory {
    pub fn with_color_space(color_space: ColorSpace) -> Self {
        Self {
            color_space: Some(color_space),
        }
    }
}

impl ScalerFactory for SoftwareScalerFactory {
    fn create(&self, key: ConversionKey, order: ChannelOrder) -> Result<Box<dyn Scaler>, ConvertError> {
        if key.width == 0 || key.height == 0 {
            return Err(ConvertError::Context(format!(
                "empty geometry {}x{}",
                key.width, key.height
            )));
        }
        let color_space = self
            .color_space
            .unwrap_or_else(|| ColorSpace::for_height(key.height));
        Ok(Box::new(SoftwareScaler::new(key, order, color_space)))
    }

    fn name(&self) -> &str {
        "software"
    }
}
