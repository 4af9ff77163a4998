//! The HTTP client used to forward pkt-line commands to an upstream Git host
//! (spec.md §4.4.1 step 1, §4.4.2 step 1).
//!
//! Two shapes are needed: a byte-exact passthrough for `ls-refs` forwarding
//! (the proxy must not interpret capabilities it doesn't understand), and a
//! decoded form for the cheap internal `ls-refs` the `fetch` cache-decision
//! engine issues to learn upstream ref tips.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::config::{Token, TokenSource};
use crate::error::{Error, Result};
use crate::git::RefEntry;
use crate::pktline::{self, PktLine};
use crate::protocol;

pub struct UpstreamClient {
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
}

impl UpstreamClient {
    pub fn new(token_source: Arc<dyn TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_source,
        }
    }

    pub async fn token_for(&self, canonical_url: &str) -> Result<Token> {
        self.token_source.token_for(canonical_url).await
    }

    async fn post(&self, canonical_url: &str, body: Vec<u8>) -> Result<reqwest::Response> {
        let token = self.token_for(canonical_url).await?;
        let url = format!("{canonical_url}/git-upload-pack");
        let mut request = self
            .http
            .post(&url)
            .header("Git-Protocol", "version=2")
            .header("Content-Type", "application/x-git-upload-pack-request")
            .body(body);
        if let Some(auth) = token.authorization_header() {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable(format!("upstream request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "upstream {url} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Forwards `raw_command` byte-exact, returning the response chunks as
    /// they arrive (spec.md §4.4.1 step 1: "forwarded to upstream byte-exact").
    pub async fn ls_refs_stream(
        &self,
        canonical_url: &str,
        raw_command: Bytes,
    ) -> Result<impl Stream<Item = Result<Bytes>>> {
        let response = self.post(canonical_url, raw_command.to_vec()).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::unavailable(format!("upstream read failed: {e}")))))
    }

    /// Issues a synthetic `ls-refs` restricted to `ref_names` and decodes the
    /// response into (oid, refname) pairs, for the `fetch` cache-decision
    /// engine (spec.md §4.4.2 step 1). `symref-target:` lines are dropped;
    /// only ref entries are relevant here.
    pub async fn resolve_refs(&self, canonical_url: &str, ref_names: &[String]) -> Result<Vec<RefEntry>> {
        let body = protocol::build_ls_refs_for_refs(ref_names);
        let response = self.post(canonical_url, body).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::unavailable(format!("upstream read failed: {e}")))?;

        let mut refs = Vec::new();
        for line in pktline::decode_all(bytes)? {
            let PktLine::Data(payload) = line else { continue };
            let text = String::from_utf8_lossy(&payload);
            let text = text.trim_end_matches('\n');
            if text.starts_with("symref-target:") {
                continue;
            }
            if let Some((oid, name)) = text.split_once(' ') {
                refs.push(RefEntry {
                    oid: oid.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(refs)
    }
}
