//! The distributor ring status page.

use hyper::{header::CONTENT_TYPE, Body, Response, StatusCode};
use shard_ring::{now_unix, InstanceState, RingDesc};

/// The page served when the distributor runs without a ring (no global
/// limits).
const RING_NOT_ENABLED_PAGE: &str = "\
<!DOCTYPE html>
<html>
    <head>
        <meta charset=\"UTF-8\">
        <title>Distributor Status</title>
    </head>
    <body>
        <h1>Distributor Status</h1>
        <p>Distributor is not running with global limits enabled</p>
    </body>
</html>";

/// Render the ring status page.
///
/// `desc` is the last ring view published by the lifecycler; `None` when
/// the ring is disabled.
pub(crate) fn ring_status_page(desc: Option<RingDesc>) -> Response<Body> {
    let body = match desc {
        Some(desc) => ring_page(&desc),
        None => RING_NOT_ENABLED_PAGE.to_owned(),
    };

    // Infallible: the parts are statically valid.
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_default()
}

fn ring_page(desc: &RingDesc) -> String {
    use std::fmt::Write;

    let now = now_unix();
    let mut rows = String::new();
    for (id, instance) in &desc.instances {
        let _ = write!(
            rows,
            "\n            <tr>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}s ago</td>\
             </tr>",
            html_escape(id),
            html_escape(&instance.addr),
            html_escape(&instance.zone),
            state_name(instance.state),
            instance.tokens.len(),
            now.saturating_sub(instance.heartbeat_unix),
        );
    }

    format!(
        "\
<!DOCTYPE html>
<html>
    <head>
        <meta charset=\"UTF-8\">
        <title>Distributor Ring</title>
    </head>
    <body>
        <h1>Distributor Ring</h1>
        <table border=\"1\">
            <tr>\
            <th>Instance</th><th>Address</th><th>Zone</th>\
            <th>State</th><th>Tokens</th><th>Heartbeat</th>\
            </tr>{rows}
        </table>
    </body>
</html>"
    )
}

fn state_name(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Joining => "JOINING",
        InstanceState::Active => "ACTIVE",
        InstanceState::Leaving => "LEAVING",
        InstanceState::Left => "LEFT",
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
