//! Shareable conference link reconciliation

use tracing::{debug, warn};

use crate::signaling::SessionId;

use super::reconcile::{AssignmentSource, FirstWriterWins, Reconciliation};

/// Holds the first conference link reported for a session
///
/// The link may arrive from the companion `create_session` reply and from a
/// `session_created` push. Later arrivals never overwrite the first one.
#[derive(Debug, Default)]
pub struct ConferenceLinkResolver {
    link: FirstWriterWins<String>,
}

impl ConferenceLinkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a link. Returns it when it is the first one and should be published.
    pub fn resolve(&mut self, link: String, source: AssignmentSource) -> Option<String> {
        match self.link.offer(link.clone()) {
            Reconciliation::Accepted => {
                debug!("Conference link from {}: {}", source, link);
                Some(link)
            }
            Reconciliation::Unchanged => {
                debug!("Conference link from {} already known", source);
                None
            }
            Reconciliation::Conflict { kept } => {
                warn!(
                    "Ignoring conference link {} from {}, keeping {}",
                    link, source, kept
                );
                None
            }
        }
    }

    pub fn link(&self) -> Option<&str> {
        self.link.get().map(String::as_str)
    }
}

/// Split a shared conference link into its session id and join code
///
/// Links look like `https://host/join/<session id>?code=<digits>`.
pub fn parse_conference_link(link: &str) -> Option<(SessionId, String)> {
    let (path, query) = link.split_once('?')?;
    let (_, rest) = path.split_once("://")?;
    let (_, tail) = rest.split_once('/')?;
    let session_id = tail
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())?;
    let code = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("code="))
        .filter(|code| !code.is_empty())?;
    Some((SessionId::new(session_id), code.to_string()))
}
