//! Blocking HTTP calls to the transposition service, run off the UI thread.

use std::time::Duration;

use anyhow::Context;
use crossbeam::channel::Sender;
use reqwest::blocking::Client;
use serde::Serialize;
use stemsync_core::{ChangeRequest, ChangeResponse, ResetRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Key,
    Bpm,
    Reset,
}

impl RequestKind {
    fn endpoint(self) -> &'static str {
        match self {
            RequestKind::Key => "change_key",
            RequestKind::Bpm => "change_bpm",
            RequestKind::Reset => "reset",
        }
    }
}

/// The session state a request was issued against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    song_id: String,
    epoch: u64,
}

/// Issues tickets and tells replies for the current state from stale ones.
///
/// Opening a song or resetting locally invalidates every ticket issued
/// before it.
#[derive(Debug, Default)]
pub struct Tickets {
    song_id: String,
    epoch: u64,
}

impl Tickets {
    pub fn issue(&self) -> Ticket {
        Ticket {
            song_id: self.song_id.clone(),
            epoch: self.epoch,
        }
    }

    pub fn invalidate(&mut self, song_id: &str) {
        self.epoch += 1;
        self.song_id = song_id.to_string();
    }

    pub fn is_current(&self, ticket: &Ticket) -> bool {
        ticket.epoch == self.epoch && ticket.song_id == self.song_id
    }
}

pub struct Reply {
    pub kind: RequestKind,
    pub ticket: Ticket,
    pub result: anyhow::Result<ChangeResponse>,
}

#[derive(Clone)]
pub struct TranspositionClient {
    base_url: String,
    http: Client,
}

impl TranspositionClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(5 * 60))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, kind: RequestKind) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), kind.endpoint())
    }

    fn post<T: Serialize>(&self, kind: RequestKind, body: &T) -> anyhow::Result<ChangeResponse> {
        let url = self.url(kind);
        log::debug!("POST {url}");
        self.http
            .post(&url)
            .json(body)
            .send()
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("{url} failed"))?
            .json()
            .with_context(|| format!("reading response from {url}"))
    }

    /// Send a key or tempo change on a worker thread. The reply arrives on
    /// `replies`.
    pub fn spawn_change(
        &self,
        kind: RequestKind,
        request: ChangeRequest,
        ticket: Ticket,
        replies: Sender<Reply>,
    ) {
        let client = self.clone();
        std::thread::spawn(move || {
            let result = client.post(kind, &request);
            let _ = replies.send(Reply {
                kind,
                ticket,
                result,
            });
        });
    }

    pub fn spawn_reset(&self, request: ResetRequest, ticket: Ticket, replies: Sender<Reply>) {
        let client = self.clone();
        std::thread::spawn(move || {
            let result = client.post(RequestKind::Reset, &request);
            let _ = replies.send(Reply {
                kind: RequestKind::Reset,
                ticket,
                result,
            });
        });
    }
}
