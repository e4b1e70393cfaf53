use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::models::Camera;
use crate::utils::run_command;

const LIST_TIMEOUT: Duration = Duration::from_secs(15);

// --camera-id=0    (back, 4080x3060, fps=[10, 15, 20, 24, 30])
static CAMERA_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"--camera-id=(\d+)\s+\((\w+),\s*\d+x\d+,\s*fps=\[([^\]]+)\]")
        .expect("valid camera header pattern")
});

//         - 1920x1080
static CAMERA_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+-\s*(\d+x\d+)").expect("valid camera size pattern"));

/// Parses `scrcpy --list-camera-sizes` output into cameras keyed by id.
pub fn parse_camera_sizes(output: &str) -> BTreeMap<String, Camera> {
    let mut cameras: BTreeMap<String, Camera> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if let Some(caps) = CAMERA_HEADER.captures(line) {
            let id = caps[1].to_string();
            cameras.insert(
                id.clone(),
                Camera {
                    facing: caps[2].to_string(),
                    fps: caps[3].split(',').map(|f| f.trim().to_string()).collect(),
                    resolutions: Vec::new(),
                },
            );
            current = Some(id);
        } else if let Some(id) = &current {
            if let Some(caps) = CAMERA_SIZE.captures(line) {
                if let Some(camera) = cameras.get_mut(id) {
                    camera.resolutions.push(caps[1].to_string());
                }
            }
        }
    }
    cameras
}

/// Queries the capture tool for camera capabilities.
#[derive(Debug, Clone)]
pub struct ScrcpyTool {
    program: String,
}

impl Default for ScrcpyTool {
    fn default() -> Self {
        Self::new("scrcpy")
    }
}

impl ScrcpyTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Cameras of `serial` (or the only attached device). A missing or hung
    /// tool yields an empty map.
    pub async fn list_cameras(&self, serial: Option<&str>) -> BTreeMap<String, Camera> {
        let mut args = vec![
            "--video-source=camera".to_string(),
            "--list-camera-sizes".to_string(),
        ];
        if let Some(serial) = serial {
            args.push(format!("--serial={}", serial));
        }
        match run_command(&self.program, &args, LIST_TIMEOUT).await {
            Ok(output) => parse_camera_sizes(&output),
            Err(e) => {
                warn!("Listing cameras failed: {:#}", e);
                BTreeMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
scrcpy 2.4 <https://github.com/Genymobile/scrcpy>
INFO: List of camera sizes:
    --camera-id=0    (back, 4080x3060, fps=[10, 15, 20, 24, 30])
        - 4080x3060
        - 1920x1080
        - 1280x720
    --camera-id=1    (front, 3264x2448, fps=[15, 24, 30, 60])
        - 1920x1080
";

    #[test]
    fn parses_cameras_and_sizes() {
        let cameras = parse_camera_sizes(LISTING);
        assert_eq!(cameras.len(), 2);

        let back = &cameras["0"];
        assert_eq!(back.facing, "back");
        assert_eq!(back.fps, vec!["10", "15", "20", "24", "30"]);
        assert_eq!(back.resolutions, vec!["4080x3060", "1920x1080", "1280x720"]);

        let front = &cameras["1"];
        assert_eq!(front.facing, "front");
        assert_eq!(front.fps.last().map(String::as_str), Some("60"));
        assert_eq!(front.resolutions, vec!["1920x1080"]);
    }

    #[test]
    fn sizes_before_any_header_are_ignored() {
        let cameras = parse_camera_sizes("        - 640x480\nERROR: no device\n");
        assert!(cameras.is_empty());
    }
}
