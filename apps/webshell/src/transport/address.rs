use super::ChannelError;
use url::Url;

const TERMINAL_PATH: [&str; 4] = ["api", "v1", "ws", "terminal"];

/// Builds `{ws|wss}://{origin}/api/v1/ws/terminal/{session_id}`, upgrading
/// the origin's own scheme and appending `?token=` when a token is known.
pub fn terminal_url(
    origin: &Url,
    session_id: &str,
    token: Option<&str>,
) -> Result<Url, ChannelError> {
    let scheme = match origin.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChannelError::InvalidAddress(format!(
                "unsupported origin scheme '{other}'"
            )));
        }
    };
    let host = origin
        .host_str()
        .ok_or_else(|| ChannelError::InvalidAddress("origin has no host".into()))?;
    let authority = match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    if session_id.trim().is_empty() {
        return Err(ChannelError::InvalidAddress("empty session id".into()));
    }

    let mut url = Url::parse(&format!("{scheme}://{authority}/"))
        .map_err(|err| ChannelError::InvalidAddress(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ChannelError::InvalidAddress("origin cannot be a base url".into()))?
        .clear()
        .extend(TERMINAL_PATH)
        .push(session_id);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}
