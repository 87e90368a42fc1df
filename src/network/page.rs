//! HTML served by the portal and the client-mode status server.

use crate::telemetry::LiveData;

const PORTAL_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{{AP_NAME}} setup</title>
<style>
body { font-family: sans-serif; max-width: 28rem; margin: 1rem auto; padding: 0 1rem; color: #222; }
fieldset { border: 1px solid #ccc; border-radius: 6px; margin-bottom: 1rem; }
label { display: block; margin-top: .6rem; font-size: .9rem; }
input { width: 100%; padding: .45rem; box-sizing: border-box; }
button { padding: .6rem 1rem; margin-top: .8rem; }
#networks div { padding: .3rem; cursor: pointer; border-bottom: 1px solid #eee; }
#status { margin-top: 1rem; font-weight: bold; }
</style>
</head>
<body>
<h2>{{AP_NAME}}</h2>
<p>Water level: <span id="level">-</span> (<span id="pct">-</span>%)</p>
<fieldset>
<legend>Wi-Fi network</legend>
<button type="button" onclick="scan()">Scan</button>
<div id="networks"></div>
<label>Network name<input id="ssid"></label>
<label>Password<input id="password" type="password"></label>
</fieldset>
<fieldset>
<legend>Backend</legend>
<label>Host<input id="api_host"></label>
<label>Port<input id="api_port" type="number" value="80" min="1" max="65535"></label>
<label>Endpoint<input id="api_endpoint" value="/tank/api/tank_update.php"></label>
<label>API key<input id="api_key"></label>
</fieldset>
<button type="button" onclick="save()">Save and restart</button>
<div id="status"></div>
<script>
function $(id) { return document.getElementById(id); }
function scan() {
  fetch('/scan').then(r => r.json()).then(d => {
    const list = $('networks');
    list.innerHTML = '';
    d.networks.forEach(n => {
      const row = document.createElement('div');
      row.textContent = n.ssid + ' (' + n.rssi + ' dBm)';
      row.onclick = () => { $('ssid').value = n.ssid; $('password').focus(); };
      list.appendChild(row);
    });
    if (!d.networks.length) list.textContent = 'No networks yet, try again shortly.';
  }).catch(() => { $('status').textContent = 'Scan failed'; });
}
function save() {
  const body = {
    ssid: $('ssid').value,
    password: $('password').value,
    api_host: $('api_host').value,
    api_port: parseInt($('api_port').value, 10) || 80,
    api_endpoint: $('api_endpoint').value,
    api_key: $('api_key').value
  };
  fetch('/save', { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: JSON.stringify(body) })
    .then(r => r.json())
    .then(d => { $('status').textContent = d.success ? 'Saved, restarting...' : 'Rejected: network name and password are required'; })
    .catch(() => { $('status').textContent = 'Save failed'; });
}
function refresh() {
  fetch('/data').then(r => r.json()).then(d => { $('level').textContent = d.water_level; $('pct').textContent = d.percentage; }).catch(() => {});
}
setTimeout(scan, 1000);
setInterval(refresh, 5000);
refresh();
</script>
</body>
</html>
"#;

/// The configuration page, titled with the access point name.
pub fn portal_page(ap_name: &str) -> String {
    PORTAL_TEMPLATE.replace("{{AP_NAME}}", &escape_html(ap_name))
}

/// The client-mode status page.
pub fn status_page(name: &str, live: &LiveData, fresh: bool) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\"><title>{name}</title></head>\n\
         <body><h2>{name}</h2>\n<p>Water level: {level} ({pct}%){stale}</p>\n\
         <p>Network: {net}</p>\n<p><a href=\"/data\">JSON</a></p></body></html>\n",
        name = escape_html(name),
        level = live.water_level,
        pct = live.percentage,
        stale = if fresh { "" } else { " <em>stale</em>" },
        net = if live.wifi_connected { "connected" } else { "disconnected" },
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
