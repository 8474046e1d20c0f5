//! Sample identifier for plunderphonics tracks.
//!
//! The binary resolves a local file, Bandcamp page or YouTube URL,
//! fetches it, and sweeps speed-shifted probes against a remote
//! music-identification service until the original sample emerges. It can
//! also run as an HTTP service exposing the same search as queued jobs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};

use ident::{ShazamClient, TrackIdentifier};
use media::MediaUri;

mod ident;
mod media;
mod server;
mod signature;

#[derive(Parser)]
#[command(name = "samplehound", version)]
#[command(about = "Finds the original tracks sampled in slowed and sped-up edits")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the original sample(s) in a track or album
    Id {
        /// Filepath or URL (YouTube or Bandcamp) to identify
        uri: String,

        /// Identify only the n-th track of an album (1-based)
        #[arg(long)]
        track: Option<usize>,
    },
    /// Run as an identification web service
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Directory holding the job log
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Id { uri, track } => cmd_id(&uri, track).await,
        Commands::Serve { addr, dir } => server::serve(&addr, &dir).await,
    }
}

async fn cmd_id(raw: &str, track: Option<usize>) -> anyhow::Result<()> {
    let client = ShazamClient::new();
    let (uri, is_album) = media::resolve_uri(raw).await?;
    if !is_album && track.is_some() {
        bail!("--track is only valid for albums");
    }

    if is_album && track.is_none() {
        let playlist = media::fetch_playlist(&uri).await?;
        println!("{}\n", playlist.title);
        for (i, entry) in playlist.entries.iter().enumerate() {
            println!("{:2}. {}", i + 1, entry.title);
            match identify_one(&client, &entry.uri).await {
                Ok(Some(sample)) => print_sample(&client, &sample).await,
                Ok(None) => println!("X  Match not found :/"),
                Err(err) => println!("Error: {err}"),
            }
            println!();
        }
        return Ok(());
    }

    let uri = match track {
        Some(n) => {
            let playlist = media::fetch_playlist(&uri).await?;
            if n < 1 || n > playlist.entries.len() {
                bail!("invalid track number");
            }
            playlist.entries[n - 1].uri.clone()
        }
        None => uri,
    };
    match identify_one(&client, &uri).await? {
        Some(sample) => print_sample(&client, &sample).await,
        None => bail!("no match found"),
    }
    Ok(())
}

/// Fetch one track and run the probe sweep, printing each probe's outcome
/// as it lands.
async fn identify_one(
    client: &ShazamClient,
    uri: &MediaUri,
) -> anyhow::Result<Option<ident::IdentifyResult>> {
    let path = media::fetch_track(uri).await?;
    let mut id = TrackIdentifier::new(path);
    loop {
        let params = id.current_params();
        let res = ident::identify_path(client, &id.path, params).await?;
        if res.result.found {
            println!(
                "✔  {} @ {:.2}x: {} - {} ({:.0}% match)",
                render_time(params.offset),
                params.ratio,
                res.result.artist,
                res.result.title,
                100.0 * (1.0 - res.skew),
            );
        } else {
            println!(
                "X  {} @ {:.2}x: <no match>",
                render_time(params.offset),
                params.ratio,
            );
        }
        if id.handle_result(res).is_none() {
            break;
        }
    }
    Ok(id.sample)
}

async fn print_sample(client: &ShazamClient, sample: &ident::IdentifyResult) {
    println!(
        "\n✔  {} - {} ({:.0}% match @ {:.2}x speed)",
        sample.result.artist,
        sample.result.title,
        100.0 * (1.0 - sample.skew),
        sample.params.ratio,
    );
    if !sample.result.album.is_empty() {
        if sample.result.year.is_empty() {
            println!("   {}", sample.result.album);
        } else {
            println!("   {} ({})", sample.result.album, sample.result.year);
        }
    }
    if sample.result.apple_id.is_empty() {
        return;
    }
    match client.links(&sample.result.apple_id).await {
        Ok(links) if links.is_empty() => println!("   Streaming links not found :/"),
        Ok(links) => {
            for (site, url) in links {
                println!("   {site}: {url}");
            }
        }
        Err(err) => println!("   Error fetching links: {err}"),
    }
}

fn render_time(offset: Duration) -> String {
    let secs = offset.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_rendering() {
        assert_eq!(render_time(Duration::from_secs(0)), "00:00");
        assert_eq!(render_time(Duration::from_secs(24)), "00:24");
        assert_eq!(render_time(Duration::from_secs(72)), "01:12");
        assert_eq!(render_time(Duration::from_secs(600)), "10:00");
    }
}
