//! Negotiate exchange preceding the transport connection.
//!
//! The client POSTs to `<base>/negotiate`, following `url` redirects, until
//! the server names a connection and its available transports.

use std::time::Duration;

use serde::Deserialize;

use crate::{
    error::{HubError, NegotiateError},
    http::{HttpClient, HttpHeaders, HttpMethod, HttpRequest},
    protocol::TransferFormat,
    transport::TransportKind,
};

/// Redirect hops allowed before negotiation fails.
pub const MAX_NEGOTIATE_ATTEMPTS: usize = 100;

const NEGOTIATE_VERSION: u32 = 1;

/// Fields only an ASP.NET SignalR (non-Core) server sends.
const LEGACY_FIELDS: [&str; 4] = ["ProtocolVersion", "TryWebSockets", "ConnectionToken", "Url"];

/// Derive the negotiate URL from a hub URL, keeping its query string.
#[must_use]
pub fn resolve_negotiate_url(url: &str) -> String {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let mut negotiate = format!("{}/negotiate", path.trim_end_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        negotiate.push('?');
        negotiate.push_str(query);
    }
    if query.is_some_and(|q| q.contains("negotiateVersion")) {
        negotiate
    } else {
        append_query_string(&negotiate, &format!("negotiateVersion={NEGOTIATE_VERSION}"))
    }
}

/// Append `pair` to the query string of `url`.
#[must_use]
pub fn append_query_string(url: &str, pair: &str) -> String {
    let separator = match url.split_once('?') {
        None => '?',
        Some((_, query)) if query.is_empty() => return format!("{url}{pair}"),
        Some(_) => '&',
    };
    format!("{url}{separator}{pair}")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
    #[serde(default)]
    transfer_formats: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    #[serde(default)]
    negotiate_version: u32,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

fn parse_response(body: &[u8]) -> Result<NegotiateResponse, NegotiateError> {
    let raw: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| NegotiateError::InvalidResponse(e.to_string()))?;
    if let Some(object) = raw.as_object() {
        if LEGACY_FIELDS.iter().any(|field| object.contains_key(*field)) {
            return Err(NegotiateError::LegacyServer);
        }
    }
    serde_json::from_value(raw).map_err(|e| NegotiateError::InvalidResponse(e.to_string()))
}

/// Pick the transport to use from the server's offer.
fn select_transport(
    requested: TransportKind,
    format: TransferFormat,
    available: &[AvailableTransport],
) -> Result<TransportKind, NegotiateError> {
    let offers = |kind: TransportKind| {
        available.iter().any(|t| {
            t.transport == kind.as_str()
                && (t.transfer_formats.is_empty()
                    || t.transfer_formats.iter().any(|f| f == format.as_str()))
        })
    };
    let candidates: &[TransportKind] = match requested {
        TransportKind::All => &[TransportKind::WebSockets, TransportKind::LongPolling],
        TransportKind::WebSockets => &[TransportKind::WebSockets],
        TransportKind::LongPolling => &[TransportKind::LongPolling],
    };
    candidates
        .iter()
        .copied()
        .find(|kind| offers(*kind))
        .ok_or(NegotiateError::NoCompatibleTransport)
}

/// What a completed negotiation decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateOutcome {
    /// URL the transport connects to, including the `id` parameter.
    pub url: String,
    pub transport: TransportKind,
    /// Connection id reported to the user.
    pub connection_id: Option<String>,
    /// Token the long-polling transport authenticates with.
    pub connection_token: Option<String>,
}

/// Everything one negotiation needs from the connection.
pub(crate) struct Negotiation<'a> {
    pub http: &'a dyn HttpClient,
    pub requested: TransportKind,
    pub format: TransferFormat,
    pub timeout: Duration,
}

impl Negotiation<'_> {
    /// Negotiate against `base_url`, following redirects.
    ///
    /// A redirect response carrying `accessToken` replaces the
    /// `Authorization` header in `headers` for the rest of this attempt.
    pub(crate) async fn run(
        &self,
        base_url: &str,
        headers: &mut HttpHeaders,
    ) -> Result<NegotiateOutcome, HubError> {
        let mut url = base_url.to_owned();
        for attempt in 1..=MAX_NEGOTIATE_ATTEMPTS {
            let response = self.request(&url, headers).await?;
            if let Some(token) = &response.access_token {
                headers.insert("Authorization".into(), format!("Bearer {token}"));
            }
            match response.url {
                Some(redirect) => {
                    tracing::debug!(attempt, redirect = %redirect, "negotiate redirected");
                    url = redirect;
                }
                None => return self.finish(&url, response),
            }
        }
        Err(NegotiateError::RedirectLimit.into())
    }

    async fn request(
        &self,
        url: &str,
        headers: &HttpHeaders,
    ) -> Result<NegotiateResponse, HubError> {
        let negotiate_url = resolve_negotiate_url(url);
        tracing::debug!(url = %negotiate_url, "sending negotiate request");
        let request = HttpRequest::new(HttpMethod::Post, negotiate_url)
            .headers(headers.clone())
            .timeout(self.timeout);
        let response = self.http.send(request).await?;
        if response.status != 200 {
            return Err(NegotiateError::UnexpectedStatus {
                status: response.status,
                reason: response.status_text,
            }
            .into());
        }
        let parsed = parse_response(&response.body)?;
        if let Some(error) = parsed.error {
            return Err(NegotiateError::Server(error).into());
        }
        Ok(parsed)
    }

    fn finish(&self, url: &str, response: NegotiateResponse) -> Result<NegotiateOutcome, HubError> {
        let transport =
            select_transport(self.requested, self.format, &response.available_transports)?;
        let token = if response.negotiate_version > 0 {
            response.connection_token.or_else(|| response.connection_id.clone())
        } else {
            response.connection_id.clone()
        };
        let connection_id = response.connection_id;
        let final_url = match &token {
            Some(token) => append_query_string(url, &format!("id={token}")),
            None => url.to_owned(),
        };
        Ok(NegotiateOutcome {
            url: final_url,
            transport,
            connection_id,
            connection_token: token,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("http://example.com", "http://example.com/negotiate?negotiateVersion=1")]
    #[case("http://example.com/", "http://example.com/negotiate?negotiateVersion=1")]
    #[case("http://example.com/hub?a=b", "http://example.com/hub/negotiate?a=b&negotiateVersion=1")]
    #[case(
        "http://example.com/hub?negotiateVersion=2",
        "http://example.com/hub/negotiate?negotiateVersion=2"
    )]
    fn negotiate_url_is_derived(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(resolve_negotiate_url(url), expected);
    }

    #[rstest]
    #[case("http://example.com", "http://example.com?id=1")]
    #[case("http://example.com?", "http://example.com?id=1")]
    #[case("http://example.com?a=b", "http://example.com?a=b&id=1")]
    fn query_pairs_are_appended(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(append_query_string(url, "id=1"), expected);
    }

    #[rstest]
    #[case(r#"{"Url":"/signalr","ConnectionToken":"x","ProtocolVersion":"1.5"}"#)]
    #[case(r#"{"TryWebSockets":true}"#)]
    fn legacy_servers_are_detected(#[case] body: &str) {
        assert_eq!(
            parse_response(body.as_bytes()).map(|_| ()),
            Err(NegotiateError::LegacyServer)
        );
    }

    fn transports(names: &[(&str, &[&str])]) -> Vec<AvailableTransport> {
        names
            .iter()
            .map(|(name, formats)| AvailableTransport {
                transport: (*name).to_owned(),
                transfer_formats: formats.iter().map(|f| (*f).to_owned()).collect(),
            })
            .collect()
    }

    #[test]
    fn websockets_is_preferred() {
        let available = transports(&[("LongPolling", &["Text"]), ("WebSockets", &["Text"])]);
        assert_eq!(
            select_transport(TransportKind::All, TransferFormat::Text, &available),
            Ok(TransportKind::WebSockets)
        );
    }

    #[test]
    fn transfer_format_must_be_offered() {
        let available = transports(&[("WebSockets", &["Text"]), ("LongPolling", &["Text", "Binary"])]);
        assert_eq!(
            select_transport(TransportKind::All, TransferFormat::Binary, &available),
            Ok(TransportKind::LongPolling)
        );
    }

    #[test]
    fn missing_requested_transport_is_rejected() {
        let available = transports(&[("ServerSentEvents", &["Text"])]);
        assert_eq!(
            select_transport(TransportKind::All, TransferFormat::Text, &available),
            Err(NegotiateError::NoCompatibleTransport)
        );
        let available = transports(&[("LongPolling", &["Text"])]);
        assert_eq!(
            select_transport(TransportKind::WebSockets, TransferFormat::Text, &available),
            Err(NegotiateError::NoCompatibleTransport)
        );
    }
}
