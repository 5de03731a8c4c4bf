//! Decoded frames handed between the decoder and the encode graph.
//!
//! A frame never carries pixel data through the process: it carries a
//! DMA-BUF file descriptor that the V4L2 decoder exported and the encoder
//! imports. The descriptor is exclusively owned by exactly one [`DmaFrame`];
//! hand-off across a boundary goes through [`DmaFrame::duplicate`] so each
//! holder closes its own descriptor.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

/// DMA-BUF frames carry at most a luma and a chroma plane.
pub const MAX_PLANES: usize = 2;

/// Pixel layouts the encode graph accepts. NV12 is what the V4L2 decoders
/// produce; the alternates appear on sources that bypass hardware decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    Rgb,
    Bgr,
}

impl PixelFormat {
    pub fn num_planes(self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Rgb | PixelFormat::Bgr => 1,
        }
    }

    /// Rows occupied by plane `index` for a frame of `height` rows.
    /// The chroma plane of NV12/NV21 is vertically subsampled.
    pub fn plane_height(self, index: usize, height: u32) -> u32 {
        match (self, index) {
            (PixelFormat::Nv12 | PixelFormat::Nv21, 1) => height.div_ceil(2),
            _ => height,
        }
    }

    /// Tightly packed stride of plane 0 for a frame `width` pixels wide.
    pub fn tight_stride(self, width: u32) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => width as usize,
            PixelFormat::Rgb | PixelFormat::Bgr => width as usize * 3,
        }
    }

    pub fn from_video_format(format: gstreamer_video::VideoFormat) -> Option<Self> {
        use gstreamer_video::VideoFormat;
        match format {
            VideoFormat::Nv12 => Some(PixelFormat::Nv12),
            VideoFormat::Nv21 => Some(PixelFormat::Nv21),
            VideoFormat::Rgb => Some(PixelFormat::Rgb),
            VideoFormat::Bgr => Some(PixelFormat::Bgr),
            _ => None,
        }
    }

    pub fn to_video_format(self) -> gstreamer_video::VideoFormat {
        use gstreamer_video::VideoFormat;
        match self {
            PixelFormat::Nv12 => VideoFormat::Nv12,
            PixelFormat::Nv21 => VideoFormat::Nv21,
            PixelFormat::Rgb => VideoFormat::Rgb,
            PixelFormat::Bgr => VideoFormat::Bgr,
        }
    }
}

/// Where one plane lives inside the DMA-BUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
}

/// One decoded frame backed by a DMA-BUF descriptor.
///
/// Non-copyable by construction; moving it moves descriptor ownership. The
/// descriptor is closed exactly once, when the frame (or whoever took the fd
/// out of it) is dropped.
#[derive(Debug)]
pub struct DmaFrame {
    fd: OwnedFd,
    width: u32,
    height: u32,
    format: PixelFormat,
    planes: [PlaneLayout; MAX_PLANES],
    /// Presentation timestamp in stream time, nanoseconds.
    pts: Option<u64>,
}

impl DmaFrame {
    /// Wrap a descriptor with an explicit plane layout. Returns `None` when
    /// the layout does not provide one entry per plane of `format`.
    pub fn with_planes(
        fd: OwnedFd,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: &[PlaneLayout],
        pts: Option<u64>,
    ) -> Option<Self> {
        if planes.len() != format.num_planes() {
            return None;
        }
        let mut fixed = [PlaneLayout::default(); MAX_PLANES];
        fixed[..planes.len()].copy_from_slice(planes);
        Some(Self {
            fd,
            width,
            height,
            format,
            planes: fixed,
            pts,
        })
    }

    /// Wrap a descriptor assuming tight packing (no padding between rows or
    /// planes). Used when the decoder attaches no explicit layout.
    pub fn tight(
        fd: OwnedFd,
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: Option<u64>,
    ) -> Self {
        let stride = format.tight_stride(width);
        let mut planes = [PlaneLayout::default(); MAX_PLANES];
        let mut offset = 0usize;
        for (index, plane) in planes.iter_mut().enumerate().take(format.num_planes()) {
            plane.offset = offset;
            plane.stride = stride;
            offset += stride * format.plane_height(index, height) as usize;
        }
        Self {
            fd,
            width,
            height,
            format,
            planes,
            pts,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn num_planes(&self) -> usize {
        self.format.num_planes()
    }

    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes[..self.format.num_planes()]
    }

    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Total bytes the encoder will read through the descriptor.
    pub fn byte_size(&self) -> usize {
        self.planes()
            .iter()
            .enumerate()
            .map(|(index, plane)| {
                plane.offset + plane.stride * self.format.plane_height(index, self.height) as usize
            })
            .max()
            .unwrap_or(0)
    }

    /// Hand-off copy: duplicates the descriptor so the receiver owns (and
    /// closes) its own copy while this frame keeps its own.
    pub fn duplicate(&self) -> io::Result<Self> {
        let fd = self.fd.try_clone()?;
        Ok(Self {
            fd,
            width: self.width,
            height: self.height,
            format: self.format,
            planes: self.planes,
            pts: self.pts,
        })
    }

    /// Surrender the descriptor, e.g. to an allocator that assumes
    /// ownership. The frame is consumed; the caller inherits the single
    /// close obligation.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, RawFd};

    /// True when `raw` still names an open descriptor in this process.
    /// fcntl on a closed fd fails with EBADF; no allocation, no side effects.
    fn fd_is_open(raw: RawFd) -> bool {
        unsafe { libc::fcntl(raw, libc::F_GETFD) != -1 }
    }

    fn test_fd() -> OwnedFd {
        // A pipe endpoint is as good as a dmabuf for ownership tests.
        let (read, _write) = nix::unistd::pipe().expect("pipe");
        read
    }

    #[test]
    fn descriptor_closed_exactly_once_on_drop() {
        let fd = test_fd();
        let raw = fd.as_raw_fd();
        let frame = DmaFrame::tight(fd, 1920, 1080, PixelFormat::Nv12, Some(0));
        assert!(fd_is_open(raw));
        drop(frame);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn duplicate_gives_independent_descriptor() {
        let fd = test_fd();
        let raw = fd.as_raw_fd();
        let frame = DmaFrame::tight(fd, 640, 480, PixelFormat::Nv12, None);
        let copy = frame.duplicate().expect("dup");
        let copy_raw = copy.fd().as_raw_fd();
        assert_ne!(raw, copy_raw);

        // Dropping the original must not invalidate the duplicate.
        drop(frame);
        assert!(!fd_is_open(raw));
        assert!(fd_is_open(copy_raw));
        drop(copy);
        assert!(!fd_is_open(copy_raw));
    }

    #[test]
    fn into_fd_transfers_the_close_obligation() {
        let fd = test_fd();
        let raw = fd.as_raw_fd();
        let frame = DmaFrame::tight(fd, 640, 480, PixelFormat::Nv12, None);
        let owned = frame.into_fd();
        assert!(fd_is_open(raw));
        drop(owned);
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn tight_nv12_layout() {
        let frame = DmaFrame::tight(test_fd(), 1920, 1080, PixelFormat::Nv12, None);
        let planes = frame.planes();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0], PlaneLayout { offset: 0, stride: 1920 });
        assert_eq!(
            planes[1],
            PlaneLayout {
                offset: 1920 * 1080,
                stride: 1920
            }
        );
        // 4:2:0 — 1.5 bytes per pixel.
        assert_eq!(frame.byte_size(), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn tight_nv12_layout_odd_height() {
        let frame = DmaFrame::tight(test_fd(), 640, 481, PixelFormat::Nv12, None);
        // Chroma plane rounds up.
        assert_eq!(frame.byte_size(), 640 * 481 + 640 * 241);
    }

    #[test]
    fn tight_bgr_layout_is_single_plane() {
        let frame = DmaFrame::tight(test_fd(), 320, 240, PixelFormat::Bgr, None);
        assert_eq!(frame.planes().len(), 1);
        assert_eq!(frame.planes()[0].stride, 960);
        assert_eq!(frame.byte_size(), 320 * 3 * 240);
    }

    #[test]
    fn with_planes_rejects_wrong_plane_count() {
        let planes = [PlaneLayout { offset: 0, stride: 1920 }];
        assert!(
            DmaFrame::with_planes(test_fd(), 1920, 1080, PixelFormat::Nv12, &planes, None)
                .is_none()
        );
    }

    #[test]
    fn with_planes_honours_padded_strides() {
        let planes = [
            PlaneLayout { offset: 0, stride: 2048 },
            PlaneLayout { offset: 2048 * 1080, stride: 2048 },
        ];
        let frame =
            DmaFrame::with_planes(test_fd(), 1920, 1080, PixelFormat::Nv12, &planes, Some(40))
                .unwrap();
        assert_eq!(frame.byte_size(), 2048 * 1080 + 2048 * 540);
        assert_eq!(frame.pts(), Some(40));
    }
}
