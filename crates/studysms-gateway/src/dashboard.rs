//! Staff dashboard: a single static page that drives the JSON API.

/// The dashboard HTML (embedded at compile time).
pub fn dashboard_html() -> &'static str {
    DASHBOARD_HTML
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Narratives Project texting</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 64rem; padding: 0 1rem; color: #222; }
  h1 { font-size: 1.5rem; }
  section { border: 1px solid #ddd; border-radius: 6px; padding: 1rem; margin-bottom: 1rem; }
  label { display: inline-block; margin: 0.25rem 1rem 0.25rem 0; }
  input { padding: 0.3rem; }
  button { padding: 0.35rem 0.9rem; cursor: pointer; }
  button.danger { background: #b00020; color: #fff; border: none; }
  table { border-collapse: collapse; width: 100%; font-size: 0.85rem; }
  th, td { border-bottom: 1px solid #eee; padding: 0.25rem 0.4rem; text-align: left; vertical-align: top; }
  pre { background: #f6f6f6; padding: 0.75rem; white-space: pre-wrap; max-height: 24rem; overflow: auto; }
</style>
</head>
<body>
<h1>Narratives Project texting</h1>

<section>
  <h2>Distribute today's texts</h2>
  <label><input type="checkbox" id="dry-run"> dry run (log only)</label>
  <label>Date override <input id="dist-date" placeholder="MM/DD/YYYY"></label>
  <button onclick="distribute()">Distribute</button>
</section>

<section>
  <h2>Add participant</h2>
  <label>Name <input id="add-name" placeholder="First Last"></label>
  <label>Phone <input id="add-phone" placeholder="6502235997"></label>
  <label>Study date <input id="add-date" placeholder="MM/DD/YYYY"></label>
  <button onclick="addParticipant()">Add</button>
</section>

<section>
  <h2>Bulk import</h2>
  <p>CSV, TSV or XLSX with columns <code>subject_name</code>, <code>phone_number</code>, <code>date_of_study</code>.</p>
  <input type="file" id="import-file" accept=".csv,.tsv,.txt,.xlsx">
  <button onclick="importFile()">Import</button>
</section>

<section>
  <h2>Ignore or change number</h2>
  <label>Name <input id="edit-name"></label>
  <label>Phone <input id="edit-phone"></label>
  <button onclick="setIgnore(true)">Ignore</button>
  <button onclick="setIgnore(false)">Un-ignore</button>
  <br>
  <label>New phone <input id="edit-new-phone"></label>
  <button onclick="changeNumber()">Change number</button>
</section>

<section>
  <h2>Logs</h2>
  <button onclick="show('/api/v1/participants')">Participants</button>
  <button onclick="show('/api/v1/messages/outgoing')">Outgoing texts</button>
  <button onclick="show('/api/v1/messages/incoming')">Incoming texts</button>
  <button onclick="show('/api/v1/messages/failures')">Errors</button>
</section>

<section>
  <h2>Admin</h2>
  <label>Test number <input id="test-phone"></label>
  <button onclick="testSms()">Send test text</button>
  <br>
  <label>Type YES to reset <input id="reset-confirm"></label>
  <button class="danger" onclick="resetDb()">Reset participants</button>
</section>

<pre id="output">Ready.</pre>

<script>
const out = document.getElementById('output');
const val = id => document.getElementById(id).value.trim();

async function call(method, url, body) {
  const opts = { method, headers: {} };
  if (body instanceof FormData) {
    opts.body = body;
  } else if (body !== undefined) {
    opts.headers['Content-Type'] = 'application/json';
    opts.body = JSON.stringify(body);
  }
  out.textContent = 'Working...';
  try {
    const res = await fetch(url, opts);
    const json = await res.json();
    out.textContent = `HTTP ${res.status}\n` + JSON.stringify(json, null, 2);
  } catch (e) {
    out.textContent = 'Request failed: ' + e;
  }
}

function distribute() {
  const params = new URLSearchParams();
  if (document.getElementById('dry-run').checked) params.set('dry_run', 'true');
  if (val('dist-date')) params.set('date', val('dist-date'));
  call('POST', '/api/v1/distribute?' + params.toString(), {});
}

function addParticipant() {
  call('POST', '/api/v1/participants', {
    subject_name: val('add-name'),
    phone_number: val('add-phone'),
    date_of_study: val('add-date'),
  });
}

function importFile() {
  const file = document.getElementById('import-file').files[0];
  if (!file) { out.textContent = 'Choose a file first.'; return; }
  const form = new FormData();
  form.append('file', file);
  call('POST', '/api/v1/participants/import', form);
}

function setIgnore(ignore) {
  call('POST', '/api/v1/participants/ignore', {
    subject_name: val('edit-name'), phone_number: val('edit-phone'), ignore,
  });
}

function changeNumber() {
  call('POST', '/api/v1/participants/phone', {
    subject_name: val('edit-name'),
    old_phone_number: val('edit-phone'),
    new_phone_number: val('edit-new-phone'),
  });
}

function show(url) { call('GET', url); }

function testSms() { call('POST', '/api/v1/test-sms', { phone_number: val('test-phone') }); }

function resetDb() { call('POST', '/api/v1/reset', { confirm: val('reset-confirm') }); }
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_links_every_staff_route() {
        let html = dashboard_html();
        for route in [
            "/api/v1/distribute",
            "/api/v1/participants",
            "/api/v1/participants/import",
            "/api/v1/participants/ignore",
            "/api/v1/participants/phone",
            "/api/v1/messages/outgoing",
            "/api/v1/messages/incoming",
            "/api/v1/messages/failures",
            "/api/v1/test-sms",
            "/api/v1/reset",
        ] {
            assert!(html.contains(route), "dashboard is missing {route}");
        }
    }
}
