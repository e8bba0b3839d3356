//! X11 SHM screen capture, wrapped behind [`FrameSource`].

use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::shm;
use x11rb::protocol::xproto::{ImageFormat, Screen};
use x11rb::rust_connection::RustConnection;

use super::{CapturedFrame, FrameSource, PixelFormat};
use crate::error::ServerError;

const BYTES_PER_PIXEL: u32 = 4;
/// One filling from SHM, one in flight to the encoder, one spare for jitter.
const POOL_SIZE: usize = 3;

pub struct X11Capture {
    conn: RustConnection,
    root: u32,
    width: u32,
    height: u32,
    shm_seg: shm::Seg,
    _shm_id: i32,
    shm_ptr: *mut u8,
    shm_size: usize,
    pool_tx: std_mpsc::Sender<Vec<u8>>,
    pool_rx: std_mpsc::Receiver<Vec<u8>>,
    start: Instant,
}

// SAFETY: the SHM pointer is only touched from `&mut self` methods.
unsafe impl Send for X11Capture {}

impl X11Capture {
    pub fn new(x_display: &str) -> Result<Self, ServerError> {
        let (conn, screen_num) = RustConnection::connect(Some(x_display))
            .map_err(|e| ServerError::CaptureFailed(format!("X display connect failed: {e}")))?;

        shm::query_version(&conn)
            .and_then(|c| c.reply())
            .map_err(|e| ServerError::CaptureFailed(format!("SHM extension unavailable: {e}")))?;

        let screen: &Screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let width = screen.width_in_pixels as u32;
        let height = screen.height_in_pixels as u32;
        let depth = screen.root_depth;

        info!(width, height, depth, x_display, "connected to X display");

        let shm_size = (width * height * BYTES_PER_PIXEL) as usize;

        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, shm_size, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            return Err(ServerError::CaptureFailed(format!(
                "shmget failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let shm_ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if shm_ptr == usize::MAX as *mut libc::c_void {
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(ServerError::CaptureFailed(format!(
                "shmat failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

        let shm_seg = conn
            .generate_id()
            .map_err(|e| ServerError::CaptureFailed(format!("generate SHM seg id: {e}")))?;
        shm::attach(&conn, shm_seg, shm_id as u32, false)
            .and_then(|c| c.check())
            .map_err(|e| ServerError::CaptureFailed(format!("SHM attach failed: {e}")))?;

        debug!(shm_seg, shm_size, "SHM segment attached");

        let (pool_tx, pool_rx) = std_mpsc::channel();
        for _ in 0..POOL_SIZE {
            let _ = pool_tx.send(vec![0u8; shm_size]);
        }

        Ok(Self {
            conn,
            root,
            width,
            height,
            shm_seg,
            _shm_id: shm_id,
            shm_ptr: shm_ptr as *mut u8,
            shm_size,
            pool_tx,
            pool_rx,
            start: Instant::now(),
        })
    }
}

impl FrameSource for X11Capture {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame>, ServerError> {
        let frame_start = Instant::now();
        shm::get_image(
            &self.conn,
            self.root,
            0,
            0,
            self.width as u16,
            self.height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            self.shm_seg,
            0,
        )
        .and_then(|c| c.reply())
        .map_err(|e| ServerError::CaptureFailed(format!("SHM GetImage failed: {e}")))?;

        let mut data = self
            .pool_rx
            .try_recv()
            .unwrap_or_else(|_| vec![0u8; self.shm_size]);
        data.resize(self.shm_size, 0);

        // SAFETY: the SHM segment is valid and sized for one full frame; we
        // hold &mut self so no concurrent access is possible.
        let shm_slice = unsafe { std::slice::from_raw_parts(self.shm_ptr, self.shm_size) };
        data.copy_from_slice(shm_slice);

        // X11 depth-24 returns BGRx; the 4th byte is undefined padding, not
        // alpha. Force it opaque so downstream BGRA-aware encoders don't see
        // random padding values as alpha.
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = 0xFF;
        }

        let remaining = timeout.saturating_sub(frame_start.elapsed());
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }

        Ok(Some(CapturedFrame {
            data,
            width: self.width,
            height: self.height,
            pixel_format: PixelFormat::Bgra,
            capture_ts_us: self.start.elapsed().as_micros() as u64,
        }))
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for X11Capture {
    fn drop(&mut self) {
        let _ = shm::detach(&self.conn, self.shm_seg);
        let _ = self.conn.flush();
        unsafe {
            libc::shmdt(self.shm_ptr as *const libc::c_void);
        }
        debug!("SHM segment detached and cleaned up");
    }
}
