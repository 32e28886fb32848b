use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::models::MediaFormat;

const EXTRACT_AUDIO_MARKER: &str = "[ExtractAudio] Destination: ";
const DOWNLOAD_MARKER: &str = "[download] Destination: ";

/// Builds the external command that performs a single media download.
///
/// The supervisor owns spawning, stream capture and signalling; an invoker
/// only decides what runs.
pub trait DownloadInvoker: Send + Sync {
    fn command(&self, url: &str, format: MediaFormat) -> Command;
}

/// Runs yt-dlp inside a sibling container through `docker exec`.
#[derive(Debug, Clone)]
pub struct YtDlpInvoker {
    docker_bin: String,
    container: String,
    output_dir: PathBuf,
}

impl YtDlpInvoker {
    pub fn new(docker_bin: String, container: String, output_dir: PathBuf) -> Self {
        Self {
            docker_bin,
            container,
            output_dir,
        }
    }

    fn ytdlp_args(&self, url: &str, format: MediaFormat) -> Vec<String> {
        let template = self.output_dir.join("%(title)s.%(ext)s");
        let template = template.to_string_lossy().into_owned();
        let mut args = vec!["yt-dlp".to_string()];
        match format {
            MediaFormat::Audio => args.extend(
                ["-x", "--audio-format", "mp3", "--audio-quality", "0"].map(String::from),
            ),
            MediaFormat::Video => {
                args.extend(["-f", "best[ext=mp4]/best"].map(String::from));
            }
        }
        args.push("-o".to_string());
        args.push(template);
        args.push(url.to_string());
        args
    }
}

impl DownloadInvoker for YtDlpInvoker {
    fn command(&self, url: &str, format: MediaFormat) -> Command {
        let mut command = Command::new(&self.docker_bin);
        command
            .arg("exec")
            .arg(&self.container)
            .args(self.ytdlp_args(url, format));
        command
    }
}

/// Recovers the final file name from yt-dlp's stdout.
///
/// The audio-extraction destination wins over the raw download destination
/// because it names the transcoded artifact. Without either marker, the last
/// non-empty line mentioning the format's extension is used.
pub fn extract_filename(output: &str, format: MediaFormat) -> Option<String> {
    let path = marker_path(output, EXTRACT_AUDIO_MARKER)
        .or_else(|| marker_path(output, DOWNLOAD_MARKER))
        .or_else(|| {
            let needle = format!(".{}", format.extension());
            output
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty() && line.contains(&needle))
        })?;

    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

pub fn has_destination_marker(output: &str) -> bool {
    output.contains("[download]") || output.contains("[ExtractAudio]")
}

fn marker_path<'a>(output: &'a str, marker: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(marker)?;
        let rest = rest.trim();
        (!rest.is_empty()).then_some(rest)
    })
}
