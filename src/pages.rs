//! HTML rendering for the captive portal.
//!
//! Pages are small enough to build with `format!`. Every value that did not
//! originate in this file goes through [`escape`].

use crate::{
    device_service_client::VisibleNetwork,
    services::{mode::Mode, provisioning::{PortalStatus, PortalView}},
};

const STYLE: &str = "body{font-family:Arial;margin:40px;background:#f0f0f0}\
.container{max-width:400px;margin:auto;background:white;padding:20px;border-radius:8px;box-shadow:0 2px 10px rgba(0,0,0,0.1)}\
.warning{background:#fff3cd;border:1px solid #ffeaa7;padding:10px;margin:10px 0;border-radius:4px}\
.network{padding:10px;border:1px solid #ddd;margin:5px 0;cursor:pointer;border-radius:4px}\
input,button{width:100%;padding:12px;margin:8px 0;border:1px solid #ddd;border-radius:4px;box-sizing:border-box}\
button{background:#007cba;color:white;border:none;cursor:pointer}";

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{}</title>\
<meta name='viewport' content='width=device-width, initial-scale=1'>\
<style>{STYLE}</style></head><body><div class='container'>{body}</div></body></html>",
        escape(title)
    )
}

fn redirect_script(target: &str, after_ms: u32) -> String {
    format!("<script>setTimeout(function(){{window.location='{target}';}},{after_ms});</script>")
}

/// Escape text for use in element content and single or double quoted
/// attribute values.
pub fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());

    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }

    escaped
}

/// Landing page, chosen by mode.
pub fn index(view: &PortalView, prefill_ssid: Option<&str>) -> String {
    let status = &view.status;

    match (status.mode, view.setup_token.as_deref()) {
        (Mode::Setup | Mode::SetupFallback, Some(token)) => setup(status, token, prefill_ssid),
        (Mode::Connecting, _) => connecting(status.network.as_deref().unwrap_or_default()),
        _ => operational(status),
    }
}

fn setup(status: &PortalStatus, token: &str, prefill_ssid: Option<&str>) -> String {
    let token = escape(token);
    let mut body = String::from("<h2>MTG Scanner WiFi Setup</h2>");

    if status.mode == Mode::SetupFallback {
        body.push_str(
            "<div class='warning'>Could not join the network. Check the name and password.</div>",
        );
    }

    body.push_str(&format!(
        "<div class='warning'>Setup expires in {}:{:02}</div>\
<p>Secure one-time setup. Connect to your WiFi:</p>\
<form action='/connect' method='POST'>\
<input type='hidden' name='token' value='{token}'>\
<input type='text' name='ssid' placeholder='WiFi Network Name' value='{}' required>\
<input type='password' name='password' placeholder='WiFi Password'>\
<button type='submit'>Connect to WiFi</button></form>\
<button onclick=\"location.href='/scan'\">Scan Networks</button>\
<button onclick=\"location.href='/stepper?token={token}'\">Test Stepper</button>",
        status.remaining_secs / 60,
        status.remaining_secs % 60,
        escape(prefill_ssid.unwrap_or_default()),
    ));

    layout("MTG Scanner Setup", &body)
}

/// Shown right after credentials were accepted. Polls `/` until the join
/// has finished.
pub fn connecting(ssid: &str) -> String {
    let body = format!(
        "<h2>Connecting Securely...</h2><p>Connecting to {}</p>{}",
        escape(ssid),
        redirect_script("/", 5000)
    );

    layout("Connecting", &body)
}

fn operational(status: &PortalStatus) -> String {
    let mut body = String::from("<h2>MTG Scanner</h2>");

    if let Some(network) = &status.network {
        body.push_str(&format!("<p>Connected to: {}</p>", escape(network)));
    }
    if let Some(address) = status.address {
        body.push_str(&format!("<p>IP: {address}</p>"));
    }

    body.push_str(
        "<p>Setup mode disabled for security</p>\
<form action='/stepper' method='POST'>\
<input type='password' name='token' placeholder='Device Token' required>\
<button type='submit'>Run Stepper</button></form>\
<form action='/reset' method='POST'>\
<input type='password' name='token' placeholder='Device Token' required>\
<button type='submit'>Reset WiFi</button></form>",
    );

    layout("MTG Scanner", &body)
}

/// Result page of an authorized actuator run.
pub fn actuator_done(mode: Mode) -> String {
    let detail = if mode.is_provisioning_open() {
        "Motor test complete"
    } else {
        "Motor run complete"
    };

    layout(
        "Stepper",
        &format!("<h2>Stepper Executed!</h2><p>{detail}</p><a href='/'>Back to Home</a>"),
    )
}

pub fn reset() -> String {
    layout(
        "WiFi Reset",
        &format!(
            "<h2>WiFi Reset</h2><p>Device returning to setup mode...</p>{}",
            redirect_script("/", 3000)
        ),
    )
}

/// Network list. Selecting an entry prefills the setup form.
pub fn scan(networks: &[VisibleNetwork]) -> String {
    let mut body = String::from("<h2>Available Networks</h2>");

    if networks.is_empty() {
        body.push_str("<p>No networks found</p>");
    }

    for network in networks {
        let ssid = escape(&network.ssid);
        body.push_str(&format!(
            "<div class='network' data-ssid=\"{ssid}\" onclick='selectNetwork(this.dataset.ssid)'>{ssid} ({}dBm)</div>",
            network.rssi
        ));
    }

    body.push_str(
        "<br><a href='/'>Back to Setup</a>\
<script>function selectNetwork(ssid){document.location='/?ssid='+encodeURIComponent(ssid);}</script>",
    );

    layout("WiFi Networks", &body)
}

pub fn error(title: &str, message: &str) -> String {
    layout(
        title,
        &format!(
            "<h2>{}</h2><p>{}</p><a href='/'>Back to Home</a>",
            escape(title),
            escape(message)
        ),
    )
}
