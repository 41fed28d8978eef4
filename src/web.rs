//! The study page server.
//!
//! ## Design
//! - Hand-rolled HTTP/1.1 over `tokio::net::TcpListener`, one task per
//!   connection; the page itself is an embedded single-file HTML app
//! - `/stream` answers with an SSE body: one `data: {"delta": …}` event per
//!   fragment, `data: [DONE]` when the turn is over, `data: {"error": …}`
//!   when it failed
//! - Every stateful route takes the sid issued by `/state`; unknown sids
//!   fail closed rather than silently recreating mid-conversation state
//! - The card preamble rides inside the assistant message content, so the
//!   ordinary transcript replay re-renders it on every load
//!
//! ## Turn lifecycle
//! 1. `/stream` claims the session (one outstanding turn per sid)
//! 2. The user message is appended and logged immediately — it survives a
//!    failed reply
//! 3. Fragments stream to the browser while a buffer accumulates
//! 4. On exhaustion the buffer is committed to the transcript exactly once,
//!    the round counter moves, and the card transition fires if armed
//! 5. A failed or torn-down stream commits nothing; the claim is released
//!    either way

use std::collections::HashMap;
use std::sync::Arc;

use colored::*;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::StudyError;
use crate::events::{EventKind, EventLogger, EventRecord};
use crate::experiment::{
    can_proceed, card_url, mark_card_shown, proceed_target, record_card_click, should_show_card,
    LinkState, LinkTargets,
};
use crate::session::{
    begin_turn, end_turn, get_or_create, with_session, Message, Role, SessionStore,
};
use crate::CompletionClient;

/// Everything one connection handler needs, shared across all connections.
pub struct App {
    pub store: SessionStore,
    pub logger: EventLogger,
    pub client: CompletionClient,
    pub targets: LinkTargets,
    pub admin_password: Option<String>,
}

/// Card markup prepended to the reply it rides on. The anchor is wired to
/// the page's click callback; the real destination is only handed out by
/// `/card-click`.
pub const CARD_PREAMBLE: &str = "<div class=\"card-box\"><p>\u{1f4a1}\u{1f9e0}\u{1f913} \
<strong>Want to learn how I come up with responses?</strong></p>\
<a href=\"#\" class=\"card-link\">Read more here \u{2192}</a></div>";

/// Embedded single-page chat application.
pub const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>💬 Chatbot AI</title>
<style>
@import url("https://fonts.googleapis.com/css2?family=Inria+Sans:wght@300;400;700&family=Inter:wght@300;400;600&display=swap");
*{margin:0;padding:0;box-sizing:border-box}
body{font-family:'Inter',sans-serif;background:#ffffff;color:#1f2430;min-height:100vh;display:flex;flex-direction:column;max-width:760px;margin:0 auto;padding:0 20px}
header{padding:26px 0 6px}
header h1{font-family:'Inria Sans',sans-serif;color:#3f39e3;font-size:1.7rem}
.subtitle{color:#5a6172;font-size:.92rem;padding-bottom:14px;border-bottom:1px solid #ececf1}
#chat{flex:1;overflow-y:auto;padding:18px 0;display:flex;flex-direction:column;gap:12px}
.msg{max-width:85%;padding:10px 14px;border-radius:12px;line-height:1.55;font-size:.95rem;white-space:pre-wrap;word-wrap:break-word}
.msg.user{align-self:flex-end;background:#3f39e3;color:#fff;border-bottom-right-radius:4px}
.msg.assistant{align-self:flex-start;background:#f2f3f7;color:#1f2430;border-bottom-left-radius:4px}
.card-box{margin:0 0 10px;padding:10px;border:1px solid #e0e0e0;border-radius:5px;background:#f8f9fa;white-space:normal}
.card-box p{margin-bottom:5px}
.card-box a{color:#007BFF;text-decoration:none}
#proceed-banner{display:none;margin:10px 0;padding:12px 14px;border:1px solid #d7e7d9;border-radius:8px;background:#f3faf4;font-size:.92rem}
#proceed-banner button{margin-top:8px;border:none;background:#2a9d4a;color:#fff;padding:8px 16px;border-radius:6px;font-family:inherit;font-size:.9rem;cursor:pointer}
#proceed-banner button:hover{background:#238a3f}
#error-notice{display:none;margin:8px 0;padding:10px 12px;border:1px solid #f1c8c8;border-radius:8px;background:#fdf3f3;color:#9d2a2a;font-size:.88rem}
#input-row{display:flex;gap:8px;padding:14px 0 24px;border-top:1px solid #ececf1}
#prompt{flex:1;border:1px solid #cfd3dd;border-radius:8px;padding:10px 12px;font-family:inherit;font-size:.95rem}
#prompt:focus{outline:none;border-color:#3f39e3}
#send{border:none;background:#3f39e3;color:#fff;padding:10px 18px;border-radius:8px;font-family:inherit;font-size:.95rem;cursor:pointer}
#send:hover{background:#332dc4}
#send:disabled,#prompt:disabled{opacity:.5;cursor:not-allowed}
</style>
</head>
<body>
<header><h1>💬 Chatbot AI</h1></header>
<p class="subtitle">Welcome to Chatbot, a new AI-powered chatbot! Feel free to ask me anything.</p>
<div id="chat"></div>
<div id="proceed-banner">
  <strong>Thanks for chatting!</strong> You have finished this part of the study.
  <br><button id="proceed-btn">Continue to survey →</button>
</div>
<div id="error-notice"></div>
<div id="input-row">
  <input type="text" id="prompt" placeholder="What would you like to know today?" autocomplete="off">
  <button id="send">Send</button>
</div>
<script>
let sid = sessionStorage.getItem('tc-sid') || '';
let awaitingReturn = false;
const chatEl = document.getElementById('chat');
const promptEl = document.getElementById('prompt');
const sendEl = document.getElementById('send');

function setBusy(b){ promptEl.disabled = b; sendEl.disabled = b; if(!b) promptEl.focus(); }

function addMsg(role, content){
  const div = document.createElement('div');
  div.className = 'msg ' + role;
  if(role === 'assistant'){ div.innerHTML = content; } else { div.textContent = content; }
  chatEl.appendChild(div);
  chatEl.scrollTop = chatEl.scrollHeight;
  return div;
}

function showError(msg){
  const el = document.getElementById('error-notice');
  el.textContent = msg + ' — your messages are saved, feel free to try again.';
  el.style.display = 'block';
}

function render(st){
  chatEl.innerHTML = '';
  for(const m of st.messages){ addMsg(m.role, m.content); }
  document.getElementById('proceed-banner').style.display = st.can_proceed ? 'block' : 'none';
  setBusy(st.busy);
}

async function refresh(){
  const r = await fetch('/state' + (sid ? '?sid=' + encodeURIComponent(sid) : ''));
  const st = await r.json();
  sid = st.sid;
  sessionStorage.setItem('tc-sid', sid);
  render(st);
}

function send(){
  const text = promptEl.value.trim();
  if(!text) return;
  promptEl.value = '';
  document.getElementById('error-notice').style.display = 'none';
  setBusy(true);
  addMsg('user', text);
  const live = addMsg('assistant', '');
  let buffer = '';
  const es = new EventSource('/stream?sid=' + encodeURIComponent(sid) + '&prompt=' + encodeURIComponent(text));
  es.onmessage = (ev) => {
    if(ev.data === '[DONE]'){ es.close(); refresh(); return; }
    const payload = JSON.parse(ev.data);
    if(payload.error){ showError(payload.error); es.close(); refresh(); return; }
    if(payload.delta){ buffer += payload.delta; live.innerHTML = buffer; }
  };
  es.onerror = () => { es.close(); refresh(); };
}

sendEl.addEventListener('click', send);
promptEl.addEventListener('keydown', (e) => { if(e.key === 'Enter') send(); });

document.addEventListener('click', async (e) => {
  const link = e.target.closest('.card-link');
  if(!link) return;
  e.preventDefault();
  const r = await fetch('/card-click?sid=' + encodeURIComponent(sid), {method: 'POST'});
  const data = await r.json();
  if(data.card_url){ awaitingReturn = true; window.open(data.card_url, '_blank'); }
});

window.addEventListener('focus', () => {
  if(awaitingReturn){ awaitingReturn = false; fetch('/card-return?sid=' + encodeURIComponent(sid)); }
});

document.getElementById('proceed-btn').addEventListener('click', () => {
  window.location.href = '/proceed?sid=' + encodeURIComponent(sid);
});

refresh();
</script>
</body>
</html>"##;

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Bind the page server and serve connections until the process dies.
pub async fn serve(bind: &str, port: u16, app: Arc<App>) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("{bind}:{port}")).await?;

    eprintln!(
        "{}",
        format!("  Study page running at http://{bind}:{port}").bright_green()
    );
    eprintln!(
        "{}",
        format!("  Event log: {}", app.logger.path().display()).bright_blue()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, app).await {
                tracing::debug!(error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    app: Arc<App>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Request line: "GET /path?query HTTP/1.1"
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(());
    }
    let path_and_query = parts[1];

    let (path, query_str) = match path_and_query.find('?') {
        Some(idx) => (&path_and_query[..idx], &path_and_query[idx + 1..]),
        None => (path_and_query, ""),
    };
    let params = parse_query(query_str);

    match path {
        "/" => {
            stream
                .write_all(http_response("200 OK", "text/html; charset=utf-8", INDEX_HTML).as_bytes())
                .await?;
        }
        "/state" => handle_state(&mut stream, &app, &params).await?,
        "/stream" => handle_stream(&mut stream, &app, &params).await?,
        "/card-click" => handle_card_click(&mut stream, &app, &params).await?,
        "/card-return" => handle_card_return(&mut stream, &app, &params).await?,
        "/proceed" => handle_proceed(&mut stream, &app, &params).await?,
        "/admin" => handle_admin(&mut stream, &app, &params).await?,
        "/admin/export" => handle_admin_export(&mut stream, &app, &params).await?,
        _ => {
            stream
                .write_all(http_response("404 Not Found", "text/plain", "Not Found").as_bytes())
                .await?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Render state
// ---------------------------------------------------------------------------

async fn handle_state(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    let sid = match get_or_create(&app.store, params.get("sid").map(String::as_str)) {
        Ok(sid) => sid,
        Err(e) => return write_json_error(stream, "500 Internal Server Error", &e.to_string()).await,
    };

    // The whole view, proceed gating included, is recomputed on every call.
    let view = with_session(&app.store, &sid, |s| {
        json!({
            "sid": sid.clone(),
            "participant_id": s.participant_id,
            "condition": s.condition_label(),
            "card_version": s.card_version_label(),
            "messages": s.messages,
            "chat_rounds": s.chat_rounds,
            "busy": s.turn_active,
            "card_shown": s.link_state != LinkState::NotShown,
            "link_clicked": s.link_clicked,
            "can_proceed": can_proceed(s),
        })
    });

    match view {
        Ok(view) => {
            stream
                .write_all(http_response("200 OK", "application/json", &view.to_string()).as_bytes())
                .await
        }
        Err(e) => write_json_error(stream, "500 Internal Server Error", &e.to_string()).await,
    }
}

// ---------------------------------------------------------------------------
// Chat turn (SSE)
// ---------------------------------------------------------------------------

enum TurnOutcome {
    Committed,
    ClientGone,
}

async fn handle_stream(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    // The browser talks to this route through EventSource, so every outcome,
    // failures included, is delivered as an SSE body.
    stream
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n",
        )
        .await?;

    let sid = params.get("sid").cloned().unwrap_or_default();
    let prompt = params.get("prompt").cloned().unwrap_or_default();

    if prompt.trim().is_empty() {
        return write_sse_failure(stream, "empty message").await;
    }

    if let Err(e) = begin_turn(&app.store, &sid) {
        return write_sse_failure(stream, &e.to_string()).await;
    }

    let outcome = run_chat_turn(stream, app, &sid, &prompt).await;
    end_turn(&app.store, &sid);

    match outcome {
        Ok(TurnOutcome::Committed) => {
            let _ = stream.write_all(b"data: [DONE]\n\n").await;
        }
        Ok(TurnOutcome::ClientGone) => {
            // Nobody is listening; the partial buffer was discarded.
        }
        Err(e) => {
            tracing::warn!(sid = %sid, error = %e, "chat turn failed");
            let _ = write_sse_failure(stream, &e.to_string()).await;
        }
    }

    Ok(())
}

async fn run_chat_turn(
    stream: &mut TcpStream,
    app: &App,
    sid: &str,
    prompt: &str,
) -> Result<TurnOutcome, StudyError> {
    // Append the user message and arm the card trigger under one lock. The
    // user message is preserved even if the reply fails below.
    let (show_card, transcript, user_record) = with_session(&app.store, sid, |s| {
        s.messages.push(Message {
            role: Role::User,
            content: prompt.to_string(),
        });
        let show_card = should_show_card(s);
        let record = EventRecord::new(s, EventKind::UserMessage, json!({ "content": prompt }));
        (show_card, s.messages.clone(), record)
    })?;
    app.logger.log_best_effort(&user_record);

    let mut buffer = String::new();

    if show_card {
        buffer.push_str(CARD_PREAMBLE);
        if write_sse(stream, &json!({ "delta": CARD_PREAMBLE })).await.is_err() {
            return Ok(TurnOutcome::ClientGone);
        }
    }

    let mut completion = app.client.stream_completion(&transcript);
    while let Some(fragment) = completion.next_fragment().await {
        match fragment {
            Ok(text) => {
                buffer.push_str(&text);
                if write_sse(stream, &json!({ "delta": text })).await.is_err() {
                    completion.abort();
                    return Ok(TurnOutcome::ClientGone);
                }
            }
            // Turn failed: nothing is committed, the stored transcript still
            // ends with the user's message.
            Err(e) => return Err(e),
        }
    }

    // Exhausted: commit the complete buffer exactly once.
    let assistant_record = with_session(&app.store, sid, |s| {
        s.messages.push(Message {
            role: Role::Assistant,
            content: buffer.clone(),
        });
        s.chat_rounds += 1;
        if show_card {
            mark_card_shown(s);
        }
        EventRecord::new(
            s,
            EventKind::AssistantResponse,
            json!({ "content": buffer, "card_shown": show_card }),
        )
    })?;
    app.logger.log_best_effort(&assistant_record);

    Ok(TurnOutcome::Committed)
}

// ---------------------------------------------------------------------------
// Card callbacks
// ---------------------------------------------------------------------------

async fn handle_card_click(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    let sid = params.get("sid").cloned().unwrap_or_default();

    let result = with_session(&app.store, &sid, |s| {
        let transitioned = record_card_click(s);
        let url = card_url(&app.targets, s);
        let record = transitioned.then(|| {
            EventRecord::new(s, EventKind::LinkClick, json!({ "card_url": url.clone() }))
        });
        (transitioned, url, record)
    });

    match result {
        Ok((transitioned, url, record)) => {
            if let Some(record) = record {
                app.logger.log_best_effort(&record);
            }
            let body = json!({ "clicked": transitioned, "card_url": url }).to_string();
            stream
                .write_all(http_response("200 OK", "application/json", &body).as_bytes())
                .await
        }
        Err(e) => write_json_error(stream, "404 Not Found", &e.to_string()).await,
    }
}

async fn handle_card_return(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    let sid = params.get("sid").cloned().unwrap_or_default();

    let record = with_session(&app.store, &sid, |s| {
        EventRecord::new(s, EventKind::ReturnFromFigma, json!({}))
    });

    match record {
        Ok(record) => {
            app.logger.log_best_effort(&record);
            stream
                .write_all(http_response("200 OK", "application/json", r#"{"ok":true}"#).as_bytes())
                .await
        }
        Err(e) => write_json_error(stream, "404 Not Found", &e.to_string()).await,
    }
}

// ---------------------------------------------------------------------------
// Proceed
// ---------------------------------------------------------------------------

async fn handle_proceed(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    let sid = params.get("sid").cloned().unwrap_or_default();

    // Recomputed here, at click time — never a cached target.
    let result = with_session(&app.store, &sid, |s| {
        if !can_proceed(s) {
            return None;
        }
        let target = proceed_target(&app.targets, s);
        let record =
            EventRecord::new(s, EventKind::ProceedClicked, json!({ "target": target.clone() }));
        Some((target, record))
    });

    match result {
        Ok(Some((target, record))) => {
            app.logger.log_best_effort(&record);
            let response = format!(
                "HTTP/1.1 302 Found\r\nLocation: {target}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await
        }
        Ok(None) => {
            write_json_error(stream, "403 Forbidden", "minimum engagement not reached").await
        }
        Err(e) => write_json_error(stream, "404 Not Found", &e.to_string()).await,
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

fn admin_authorized(app: &App, params: &HashMap<String, String>) -> bool {
    match &app.admin_password {
        Some(expected) => params.get("password").map(String::as_str) == Some(expected.as_str()),
        None => false,
    }
}

async fn handle_admin(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    if app.admin_password.is_none() {
        return stream
            .write_all(http_response("404 Not Found", "text/plain", "Not Found").as_bytes())
            .await;
    }
    if !admin_authorized(app, params) {
        return write_json_error(stream, "401 Unauthorized", "bad password").await;
    }

    let live = app.store.lock().ok().map(|guard| {
        let mut rounds = 0u64;
        let mut shown = 0u64;
        let mut clicks = 0u64;
        for s in guard.values() {
            rounds += u64::from(s.chat_rounds);
            shown += u64::from(s.link_shown_count);
            clicks += u64::from(s.link_click_count);
        }
        json!({
            "sessions": guard.len(),
            "chat_rounds": rounds,
            "links_shown": shown,
            "links_clicked": clicks,
        })
    });

    let records = app.logger.read_all().unwrap_or_default();
    let replayed = crate::events::replay_counters(&records);

    let body = json!({
        "live": live,
        "logged_events": records.len(),
        "logged_participants": replayed.len(),
        "replayed": replayed,
    })
    .to_string();

    stream
        .write_all(http_response("200 OK", "application/json", &body).as_bytes())
        .await
}

async fn handle_admin_export(
    stream: &mut TcpStream,
    app: &App,
    params: &HashMap<String, String>,
) -> std::io::Result<()> {
    if app.admin_password.is_none() {
        return stream
            .write_all(http_response("404 Not Found", "text/plain", "Not Found").as_bytes())
            .await;
    }
    if !admin_authorized(app, params) {
        return write_json_error(stream, "401 Unauthorized", "bad password").await;
    }

    let body = match app.logger.read_all() {
        Ok(records) => serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string()),
        Err(e) => return write_json_error(stream, "500 Internal Server Error", &e.to_string()).await,
    };

    stream
        .write_all(http_response("200 OK", "application/json", &body).as_bytes())
        .await
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn write_json_error(stream: &mut TcpStream, status: &str, msg: &str) -> std::io::Result<()> {
    let body = json!({ "error": msg }).to_string();
    stream
        .write_all(http_response(status, "application/json", &body).as_bytes())
        .await
}

async fn write_sse(stream: &mut TcpStream, payload: &serde_json::Value) -> std::io::Result<()> {
    stream
        .write_all(format!("data: {payload}\n\n").as_bytes())
        .await
}

/// Error event followed by the end-of-stream sentinel.
async fn write_sse_failure(stream: &mut TcpStream, msg: &str) -> std::io::Result<()> {
    write_sse(stream, &json!({ "error": msg })).await?;
    stream.write_all(b"data: [DONE]\n\n").await
}

/// Percent-decoding for URL query parameters. Decodes into bytes first so
/// multi-byte UTF-8 sequences in chat input survive.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                match std::str::from_utf8(&hex).ok().and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => bytes.push(byte),
                    None => {
                        bytes.push(b'%');
                        bytes.extend_from_slice(&hex);
                    }
                }
            }
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse a query string into decoded key-value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            if key.is_empty() {
                return None;
            }
            let val = parts.next().unwrap_or("");
            Some((key.to_string(), url_decode(val)))
        })
        .collect()
}
