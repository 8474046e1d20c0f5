//! Identification HTTP service.
//!
//! Accepts URIs over HTTP, queues them as jobs and drains the queue with
//! a single background worker, so at most one track is ever being
//! identified at a time. Finished jobs are appended to a JSON-lines log
//! and reloaded on startup.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Form, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};

use crate::ident::{identify_path, ShazamClient, TrackIdentifier};
use crate::media::{self, MediaUri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Resolving,
    Fetching,
    Identifying,
    Linking,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleParams {
    pub speed: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleEntry {
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<SampleParams>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artist: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub album: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub year: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyJob {
    pub id: String,
    pub state: JobState,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<SampleEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobLogLine {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    job: IdentifyJob,
}

/// Jobs are keyed by a short digest of the submitted URI, so resubmitting
/// the same URI lands on the same job.
pub fn job_id(uri: &str) -> String {
    Sha256::digest(uri.as_bytes())[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

struct AppState {
    jobs: Mutex<HashMap<String, IdentifyJob>>,
    uri_cache: Mutex<HashMap<String, MediaUri>>,
    queue: mpsc::UnboundedSender<String>,
    log: std::sync::Mutex<std::fs::File>,
    client: ShazamClient,
}

#[derive(Deserialize)]
struct IdentifyRequest {
    uri: String,
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>samplehound</title></head>
<body>
  <h1>samplehound</h1>
  <form method="post" action="/identify">
    <input type="text" name="uri" placeholder="YouTube or Bandcamp URL" size="60" required>
    <button type="submit">Identify</button>
  </form>
  <p>POST /identify with a <code>uri</code> form field, then poll GET /job/&lt;id&gt;.</p>
</body>
</html>
"#;

async fn handle_root() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn handle_identify(
    State(state): State<Arc<AppState>>,
    Form(req): Form<IdentifyRequest>,
) -> Json<IdentifyJob> {
    let id = job_id(&req.uri);
    let mut jobs = state.jobs.lock().await;
    let job = match jobs.get(&id) {
        Some(job) => job.clone(),
        None => {
            let job = IdentifyJob {
                id: id.clone(),
                state: JobState::Queued,
                uri: req.uri.clone(),
                sample: None,
                error: None,
            };
            jobs.insert(id.clone(), job.clone());
            if state.queue.send(id).is_err() {
                tracing::warn!("job worker is gone; request will never complete");
            }
            tracing::info!(uri = %req.uri, "queued identification job");
            job
        }
    };
    Json(job)
}

async fn handle_job(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<IdentifyJob>, (StatusCode, &'static str)> {
    match state.jobs.lock().await.get(&id) {
        Some(job) => Ok(Json(job.clone())),
        None => Err((StatusCode::NOT_FOUND, "job not found")),
    }
}

async fn set_state(state: &AppState, job: &mut IdentifyJob, s: JobState) {
    job.state = s;
    state.jobs.lock().await.insert(job.id.clone(), job.clone());
}

async fn do_job(state: &AppState, job: &mut IdentifyJob) {
    let cached = state.uri_cache.lock().await.get(&job.uri).cloned();
    let uri = match cached {
        Some(uri) => uri,
        None => {
            set_state(state, job, JobState::Resolving).await;
            let (uri, is_album) = match media::resolve_uri(&job.uri).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    job.error = Some(err.to_string());
                    return;
                }
            };
            if matches!(uri, MediaUri::File { .. }) {
                job.error = Some("local files are not supported".to_string());
                return;
            }
            if is_album {
                job.error = Some("albums are not supported over HTTP".to_string());
                return;
            }
            state.uri_cache.lock().await.insert(job.uri.clone(), uri.clone());
            uri
        }
    };

    set_state(state, job, JobState::Fetching).await;
    let path = match media::fetch_track(&uri).await {
        Ok(path) => path,
        Err(err) => {
            job.error = Some(err.to_string());
            return;
        }
    };

    set_state(state, job, JobState::Identifying).await;
    let mut id = TrackIdentifier::new(path);
    loop {
        let params = id.current_params();
        let res = match identify_path(&state.client, &id.path, params).await {
            Ok(res) => res,
            Err(err) => {
                job.error = Some(err.to_string());
                return;
            }
        };
        if id.handle_result(res).is_none() {
            break;
        }
    }

    let Some(sample) = id.sample else {
        job.sample = Some(SampleEntry { found: false, ..Default::default() });
        return;
    };

    set_state(state, job, JobState::Linking).await;
    let links = if sample.result.apple_id.is_empty() {
        BTreeMap::new()
    } else {
        state.client.links(&sample.result.apple_id).await.unwrap_or_default()
    };
    job.sample = Some(SampleEntry {
        found: true,
        params: Some(SampleParams {
            speed: sample.params.ratio,
            timestamp: sample.params.offset.as_millis() as i64,
        }),
        artist: sample.result.artist,
        title: sample.result.title,
        album: sample.result.album,
        year: sample.result.year,
        links,
    });
}

async fn run_jobs(state: Arc<AppState>, mut queue: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = queue.recv().await {
        let Some(mut job) = state.jobs.lock().await.get(&id).cloned() else {
            continue;
        };
        let start = Utc::now();
        tracing::info!(job = %id, uri = %job.uri, "starting job");
        do_job(&state, &mut job).await;
        job.state = JobState::Done;
        state.jobs.lock().await.insert(id.clone(), job.clone());
        tracing::info!(job = %id, error = ?job.error, "finished job");

        let line = JobLogLine { start, end: Utc::now(), job };
        match serde_json::to_vec(&line) {
            Ok(mut encoded) => {
                encoded.push(b'\n');
                if let Err(err) = state.log.lock().unwrap().write_all(&encoded) {
                    tracing::warn!(%err, "writing job log");
                }
            }
            Err(err) => tracing::warn!(%err, "encoding job log line"),
        }
    }
}

fn load_jobs(path: &Path) -> anyhow::Result<HashMap<String, IdentifyJob>> {
    let mut jobs = HashMap::new();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(jobs),
        Err(err) => return Err(err.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: JobLogLine = serde_json::from_str(&line)?;
        jobs.insert(parsed.job.id.clone(), parsed.job);
    }
    Ok(jobs)
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/identify", post(handle_identify))
        .route("/job/{id}", get(handle_job))
        .route("/health", get(|| async { "healthy" }))
        .with_state(state)
}

/// Run the service until the listener fails.
pub async fn serve(addr: &str, dir: &Path) -> anyhow::Result<()> {
    let log_path = dir.join("samplehound.log");
    let jobs = load_jobs(&log_path)?;
    tracing::info!(jobs = jobs.len(), "loaded job history");
    let log = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(AppState {
        jobs: Mutex::new(jobs),
        uri_cache: Mutex::new(HashMap::new()),
        queue: tx,
        log: std::sync::Mutex::new(log),
        client: ShazamClient::new(),
    });
    tokio::spawn(run_jobs(state.clone(), rx));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_stable_short_digests() {
        let a = job_id("https://youtu.be/abc");
        assert_eq!(a, job_id("https://youtu.be/abc"));
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, job_id("https://youtu.be/abd"));
    }

    #[test]
    fn job_log_round_trips() {
        let line = JobLogLine {
            start: Utc::now(),
            end: Utc::now(),
            job: IdentifyJob {
                id: job_id("uri"),
                state: JobState::Done,
                uri: "uri".to_string(),
                sample: Some(SampleEntry {
                    found: true,
                    params: Some(SampleParams { speed: 1.2, timestamp: 24_000 }),
                    artist: "A".to_string(),
                    title: "T".to_string(),
                    album: String::new(),
                    year: String::new(),
                    links: BTreeMap::from([("YouTube".to_string(), "url".to_string())]),
                }),
                error: None,
            },
        };
        let encoded = serde_json::to_string(&line).unwrap();
        // Empty optional fields stay off the wire.
        assert!(!encoded.contains("album"));
        assert!(!encoded.contains("error"));
        let decoded: JobLogLine = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.job.id, line.job.id);
        assert_eq!(decoded.job.state, JobState::Done);
        let sample = decoded.job.sample.unwrap();
        assert!(sample.found);
        assert_eq!(sample.artist, "A");
        assert_eq!(sample.links["YouTube"], "url");
    }

    #[test]
    fn startup_replays_finished_jobs() {
        let dir = std::env::temp_dir().join("samplehound_server_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("samplehound.log");

        let mut contents = String::new();
        for uri in ["one", "two"] {
            let line = JobLogLine {
                start: Utc::now(),
                end: Utc::now(),
                job: IdentifyJob {
                    id: job_id(uri),
                    state: JobState::Done,
                    uri: uri.to_string(),
                    sample: Some(SampleEntry { found: false, ..Default::default() }),
                    error: None,
                },
            };
            contents.push_str(&serde_json::to_string(&line).unwrap());
            contents.push('\n');
        }
        std::fs::write(&path, contents).unwrap();

        let jobs = load_jobs(&path).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.contains_key(&job_id("one")));
        assert_eq!(jobs[&job_id("two")].state, JobState::Done);

        assert!(load_jobs(&dir.join("missing.log")).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn job_states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&JobState::Queued).unwrap(), "\"queued\"");
        assert_eq!(
            serde_json::to_string(&JobState::Identifying).unwrap(),
            "\"identifying\""
        );
    }
}
