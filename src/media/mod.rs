//! Media acquisition.
//!
//! Resolves user input (a local path, a Bandcamp page or a YouTube URL)
//! into a closed `MediaUri` variant and fetches it to a local WAV file
//! through the external `yt-dlp` downloader. Decoding lives in
//! [`decode`].

pub mod decode;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("unsupported media: {0}")]
    Unsupported(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
    #[error("resample error: {0}")]
    Resample(String),
}

/// The closed set of media kinds the identifier accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaUri {
    File {
        path: PathBuf,
    },
    Bandcamp {
        artist_id: String,
        slug: String,
    },
    YouTube {
        id: String,
        title: String,
        chapters: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub title: String,
    pub uri: MediaUri,
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
}

fn ytdlp_bin() -> String {
    std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string())
}

async fn run_ytdlp(args: &[&str]) -> anyhow::Result<Vec<u8>> {
    let bin = ytdlp_bin();
    let output = match Command::new(&bin).args(args).output().await {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            bail!("{bin} not found");
        }
        Err(err) => return Err(err.into()),
    };
    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(output.stdout)
}

/// Keeps temp-file names readable while staying filesystem-safe.
fn escape_path_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_. ".contains(c) { c } else { '_' })
        .collect()
}

#[derive(Deserialize)]
struct YtChapter {
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct YtPlaylist {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    chapters: Vec<YtChapter>,
}

/// Parse the artist subdomain and trailing slug out of a bandcamp URL.
fn parse_bandcamp(uri: &str) -> Option<(String, String)> {
    let rest = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let labels: Vec<&str> = host.split('.').collect();
    let artist_id = labels
        .iter()
        .position(|&l| l == "bandcamp")
        .filter(|&i| i > 0)
        .map(|i| labels[i - 1].to_string())?;
    let slug = path.trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string();
    Some((artist_id, slug))
}

/// Resolve raw user input into a media URI, also reporting whether it
/// names an album (directory, bandcamp album page, chaptered video).
pub async fn resolve_uri(raw: &str) -> anyhow::Result<(MediaUri, bool)> {
    if let Ok(meta) = tokio::fs::metadata(raw).await {
        let path = Path::new(raw).to_path_buf();
        return Ok((MediaUri::File { path }, meta.is_dir()));
    }
    if raw.contains("bandcamp.com") {
        let (artist_id, slug) = parse_bandcamp(raw)
            .ok_or_else(|| anyhow!("could not parse bandcamp URL: {raw}"))?;
        let is_album = raw.contains("bandcamp.com/album");
        return Ok((MediaUri::Bandcamp { artist_id, slug }, is_album));
    }
    // Assume YouTube; let yt-dlp confirm.
    let out = run_ytdlp(&["-J", "--flat-playlist", raw])
        .await
        .map_err(|_| anyhow!("only YouTube and Bandcamp URLs are supported"))?;
    let pl: YtPlaylist = serde_json::from_slice(&out).context("parsing yt-dlp output")?;
    let is_album = !pl.chapters.is_empty();
    Ok((
        MediaUri::YouTube {
            id: pl.id,
            title: pl.title,
            chapters: pl.chapters.into_iter().map(|c| c.title).collect(),
        },
        is_album,
    ))
}

/// Download a single track to a local file, reusing an earlier download
/// when one exists. Local files pass through untouched.
pub async fn fetch_track(uri: &MediaUri) -> anyhow::Result<PathBuf> {
    match uri {
        MediaUri::File { path } => Ok(path.clone()),
        MediaUri::Bandcamp { artist_id, slug } => {
            let path = std::env::temp_dir().join(format!(
                "samplehound_bandcamp_{}.wav",
                escape_path_component(&format!("{artist_id}_{slug}"))
            ));
            if tokio::fs::metadata(&path).await.is_ok() {
                return Ok(path);
            }
            let url = format!("https://{artist_id}.bandcamp.com/track/{slug}");
            run_ytdlp(&[
                "-x",
                "--audio-format",
                "wav",
                "-o",
                path.to_str().context("non-utf8 temp path")?,
                "--",
                &url,
            ])
            .await?;
            Ok(path)
        }
        MediaUri::YouTube { id, title, .. } => {
            let path = std::env::temp_dir().join(format!(
                "samplehound_youtube_{}.wav",
                escape_path_component(title)
            ));
            if tokio::fs::metadata(&path).await.is_ok() {
                return Ok(path);
            }
            run_ytdlp(&[
                "-x",
                "--audio-format",
                "wav",
                "-o",
                path.to_str().context("non-utf8 temp path")?,
                "--",
                id,
            ])
            .await?;
            Ok(path)
        }
    }
}

/// Expand an album URI into its track list, downloading where needed.
pub async fn fetch_playlist(uri: &MediaUri) -> anyhow::Result<Playlist> {
    match uri {
        MediaUri::File { path } => {
            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(path).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(PlaylistEntry {
                    title: entry.file_name().to_string_lossy().into_owned(),
                    uri: MediaUri::File { path: entry.path() },
                });
            }
            entries.sort_by(|a, b| a.title.cmp(&b.title));
            Ok(Playlist {
                title: path.display().to_string(),
                entries,
            })
        }

        MediaUri::Bandcamp { artist_id, slug } => {
            #[derive(Deserialize)]
            struct BcEntry {
                #[serde(default)]
                title: String,
                #[serde(default)]
                url: String,
            }
            #[derive(Deserialize)]
            struct BcPlaylist {
                #[serde(default)]
                uploader_id: String,
                #[serde(default)]
                title: String,
                #[serde(default)]
                entries: Vec<BcEntry>,
            }
            let url = format!("https://{artist_id}.bandcamp.com/album/{slug}");
            let out = run_ytdlp(&["-J", "--flat-playlist", &url]).await?;
            let pl: BcPlaylist = serde_json::from_slice(&out).context("parsing yt-dlp output")?;
            let entries = pl
                .entries
                .into_iter()
                .map(|e| {
                    let slug = e.url.split_once("track/").map_or(String::new(), |(_, s)| s.to_string());
                    PlaylistEntry {
                        title: e.title,
                        uri: MediaUri::Bandcamp {
                            artist_id: artist_id.clone(),
                            slug,
                        },
                    }
                })
                .collect();
            Ok(Playlist {
                title: format!("{} - {}", pl.uploader_id, pl.title),
                entries,
            })
        }

        MediaUri::YouTube { id, title, chapters } => {
            let dst = std::env::temp_dir().join(format!("samplehound_youtube_{id}"));
            let entries: Vec<PlaylistEntry> = chapters
                .iter()
                .enumerate()
                .map(|(i, chapter)| PlaylistEntry {
                    title: chapter.clone(),
                    uri: MediaUri::File {
                        path: dst.join(format!("{} - {:03} {} [{}].wav", title, i + 1, chapter, id)),
                    },
                })
                .collect();
            // Download and split once if any chapter file is missing.
            for entry in &entries {
                let MediaUri::File { path } = &entry.uri else { continue };
                if tokio::fs::metadata(path).await.is_err() {
                    run_ytdlp(&[
                        "-x",
                        "--audio-format",
                        "wav",
                        "--split-chapters",
                        "-P",
                        dst.to_str().context("non-utf8 temp path")?,
                        id,
                    ])
                    .await?;
                    break;
                }
            }
            Ok(Playlist {
                title: title.clone(),
                entries,
            })
        }
    }
}
