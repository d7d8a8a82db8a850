use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::PixelFormat;

/// Find the first streaming capture node that offers `format`
pub fn auto_detect_device(format: PixelFormat) -> Result<PathBuf> {
    info!("Auto-detecting capture devices offering {}...", format);
    let wanted = FourCC::new(&format.fourcc());

    for i in 0..10 {
        let path = PathBuf::from(format!("/dev/video{}", i));
        if !path.exists() {
            continue;
        }
        if offers(&path, wanted) {
            info!("Found {} device: {}", format, path.display());
            return Ok(path);
        }
    }

    Err(eyre!("No capture device offering {} found", format))
}

fn offers(path: &Path, wanted: FourCC) -> bool {
    let Ok(dev) = Device::with_path(path) else {
        return false;
    };
    let Ok(caps) = dev.query_caps() else {
        return false;
    };
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
        debug!("{} cannot stream video capture", path.display());
        return false;
    }
    dev.enum_formats()
        .map(|formats| formats.iter().any(|f| f.fourcc == wanted))
        .unwrap_or(false)
}
