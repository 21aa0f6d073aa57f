use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Candidate path suffixes for the contact roster, in preference order.
/// The backend's exact route naming is not guaranteed, so the prober walks
/// these until one answers.
pub const CONTACT_CANDIDATES: [&str; 4] = [
    "/messages/contacts",
    "/messages/all",
    "/messages/users",
    "/messages/getAllContacts",
];

/// Candidate path suffixes for the conversation (chat partner) list.
pub const CHAT_CANDIDATES: [&str; 5] = [
    "/messages/chats",
    "/messages/partners",
    "/messages/chatPartners",
    "/messages/getChatPartners",
    "/messages/conversations",
];

#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("no {resource} endpoint responded ({tried} candidates probed)")]
pub struct ProbeError {
    pub resource: String,
    pub tried: usize,
    pub failures: Vec<CandidateFailure>,
}

/// A resolved endpoint plus the body it answered with, so the first probe
/// doubles as the first fetch.
#[derive(Debug, Clone)]
pub struct ProbeHit {
    pub url: String,
    pub body: serde_json::Value,
}

/// Sequentially tries candidate REST paths for a resource class and keeps
/// the first that answers with an HTTP success and a parseable JSON body.
/// One shot per candidate; a failure immediately advances to the next.
#[derive(Debug, Clone)]
pub struct EndpointProber {
    http: Client,
}

impl EndpointProber {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    pub async fn resolve(
        &self,
        base: &str,
        resource: &str,
        candidates: &[&str],
    ) -> Result<ProbeHit, ProbeError> {
        let mut failures = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let url = format!("{base}{candidate}");
            debug!("probe: trying {resource} candidate {url}");
            match self.try_candidate(&url).await {
                Ok(body) => {
                    info!("probe: resolved {resource} via {candidate}");
                    return Ok(ProbeHit { url, body });
                }
                Err(reason) => {
                    debug!("probe: {resource} candidate {candidate} failed: {reason}");
                    failures.push(CandidateFailure {
                        path: (*candidate).to_string(),
                        reason,
                    });
                }
            }
        }

        warn!(
            "probe: all {} {resource} candidates failed",
            failures.len()
        );
        Err(ProbeError {
            resource: resource.to_string(),
            tried: failures.len(),
            failures,
        })
    }

    async fn try_candidate(&self, url: &str) -> Result<serde_json::Value, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {status}"));
        }
        let text = response.text().await.map_err(|err| err.to_string())?;
        serde_json::from_str(&text).map_err(|err| format!("unparseable body: {err}"))
    }
}

#[cfg(test)]
#[path = "tests/probe_tests.rs"]
mod tests;
