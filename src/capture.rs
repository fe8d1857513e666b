use anyhow::Result;
use std::io::Read;
use std::process::Command;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::error::Quack2TexError;
use crate::menu::node::CaptureMode;

/// What a capture produced; handed to the LLM clients by value.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedInput {
    /// PNG bytes.
    Image(Vec<u8>),
    Text(String),
}

impl CapturedInput {
    /// Bytes persisted in the prompt history.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CapturedInput::Image(png) => png,
            CapturedInput::Text(text) => text.as_bytes(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CapturedInput::Image(png) => format!("image ({} bytes)", png.len()),
            CapturedInput::Text(text) => format!("text ({} chars)", text.chars().count()),
        }
    }
}

/// Blocking; always called from a worker.
pub trait CaptureSource: Send + Sync {
    fn capture(&self, mode: CaptureMode, typed_text: Option<&str>) -> Result<CapturedInput>;
}

/// Wayland capture through grim/slurp and the clipboard.
pub struct SystemCapture {
    config: CaptureConfig,
}

impl SystemCapture {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn capture_screen(&self) -> Result<CapturedInput> {
        let region_tool = &self.config.region_tool;
        let screen_tool = &self.config.screen_tool;
        for tool in [region_tool, screen_tool] {
            if which::which(tool).is_err() {
                return Err(Quack2TexError::Capture(format!("{} not found in PATH", tool)).into());
            }
        }

        let region = Command::new(region_tool)
            .output()
            .map_err(|e| Quack2TexError::Capture(format!("{} failed: {}", region_tool, e)))?;
        if !region.status.success() {
            // slurp exits non-zero when the selection is cancelled
            return Err(Quack2TexError::Capture("region selection cancelled".to_string()).into());
        }
        let geometry = String::from_utf8_lossy(&region.stdout).trim().to_string();
        debug!("Selected region {}", geometry);

        let shot = Command::new(screen_tool)
            .args(["-g", &geometry, "-"])
            .output()
            .map_err(|e| Quack2TexError::Capture(format!("{} failed: {}", screen_tool, e)))?;
        if !shot.status.success() {
            let stderr = String::from_utf8_lossy(&shot.stderr);
            return Err(Quack2TexError::Capture(format!("{} failed: {}", screen_tool, stderr.trim())).into());
        }
        if shot.stdout.is_empty() {
            return Err(Quack2TexError::Capture("screenshot is empty".to_string()).into());
        }

        info!("Captured {} byte screenshot", shot.stdout.len());
        Ok(CapturedInput::Image(shot.stdout))
    }

    fn capture_clipboard(&self) -> Result<CapturedInput> {
        let text = match read_clipboard_native() {
            Ok(text) => text,
            Err(e) => {
                debug!("Native clipboard read unavailable ({}), using wl-paste", e);
                read_clipboard_wl_paste()?
            }
        };
        if text.trim().is_empty() {
            return Err(Quack2TexError::Capture("clipboard is empty".to_string()).into());
        }
        Ok(CapturedInput::Text(text))
    }
}

fn read_clipboard_native() -> Result<String> {
    use wl_clipboard_rs::paste;
    let (mut pipe, _) = paste::get_contents(
        paste::ClipboardType::Regular,
        paste::Seat::Unspecified,
        paste::MimeType::Text,
    )
    .map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut contents = String::new();
    pipe.read_to_string(&mut contents)?;
    Ok(contents)
}

fn read_clipboard_wl_paste() -> Result<String> {
    let output = Command::new("wl-paste")
        .arg("--no-newline")
        .output()
        .map_err(|e| Quack2TexError::Capture(format!("wl-paste failed: {}", e)))?;
    if !output.status.success() {
        return Err(Quack2TexError::Capture("clipboard is empty".to_string()).into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Typed text is the only mode that needs no system access.
pub fn typed_text_input(typed_text: Option<&str>) -> Result<CapturedInput> {
    match typed_text.map(str::trim) {
        Some(text) if !text.is_empty() => Ok(CapturedInput::Text(text.to_string())),
        _ => Err(Quack2TexError::Capture("no text was entered".to_string()).into()),
    }
}

impl CaptureSource for SystemCapture {
    fn capture(&self, mode: CaptureMode, typed_text: Option<&str>) -> Result<CapturedInput> {
        debug!("Capturing input in {} mode", mode);
        match mode {
            CaptureMode::Screen => self.capture_screen(),
            CaptureMode::Clipboard => self.capture_clipboard(),
            CaptureMode::Text => typed_text_input(typed_text),
            CaptureMode::Voice => Err(Quack2TexError::Capture(
                "voice capture is not supported in this build".to_string(),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> SystemCapture {
        SystemCapture::new(&CaptureConfig::default())
    }

    #[test]
    fn test_text_capture_trims() {
        let input = capture().capture(CaptureMode::Text, Some("  x^2 + 1 \n")).unwrap();
        assert_eq!(input, CapturedInput::Text("x^2 + 1".to_string()));
        assert_eq!(input.as_bytes(), b"x^2 + 1");
    }

    #[test]
    fn test_empty_text_is_capture_error() {
        for typed in [None, Some(""), Some("   ")] {
            let err = capture().capture(CaptureMode::Text, typed).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Quack2TexError>(),
                Some(Quack2TexError::Capture(_))
            ));
        }
    }

    #[test]
    fn test_voice_is_unsupported() {
        let err = capture().capture(CaptureMode::Voice, None).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_missing_screen_tool() {
        let config = CaptureConfig {
            screen_tool: "definitely-not-a-real-grim".to_string(),
            region_tool: "definitely-not-a-real-slurp".to_string(),
        };
        let err = SystemCapture::new(&config)
            .capture(CaptureMode::Screen, None)
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_describe() {
        assert_eq!(CapturedInput::Image(vec![0; 12]).describe(), "image (12 bytes)");
        assert_eq!(CapturedInput::Text("héllo".to_string()).describe(), "text (5 chars)");
    }
}
