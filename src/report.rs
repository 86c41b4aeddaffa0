use std::fmt::Write;

use crate::agent::Role;
use crate::session::{Session, SessionSummary};

const STYLE: &str = r#"
body { font-family: system-ui, sans-serif; max-width: 860px; margin: 2rem auto; padding: 0 1rem; color: #222; }
header { border-bottom: 1px solid #ddd; margin-bottom: 1.5rem; }
.meta { color: #666; font-size: 0.9rem; }
.turn { border-left: 4px solid #999; padding: 0.5rem 1rem; margin: 1rem 0; background: #fafafa; white-space: pre-wrap; }
.turn h3 { margin: 0 0 0.5rem; font-size: 1rem; }
.speaker { border-color: #e67e22; }
.verifier { border-color: #2980b9; }
.judge { border-color: #27ae60; }
.interjection { font-style: italic; color: #555; }
form input[type=text] { width: 70%; padding: 0.4rem; }
table { border-collapse: collapse; width: 100%; }
td, th { text-align: left; padding: 0.3rem 0.5rem; border-bottom: 1px solid #eee; }
"#;

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{}</title>\n<style>{}</style>\n</head>\n<body>\n{}</body>\n</html>\n",
        escape_html(title),
        STYLE,
        body
    )
}

pub fn render_session(session: &Session) -> String {
    let mut body = String::new();
    let _ = write!(
        body,
        "<header>\n<h1>{}</h1>\n<p class=\"meta\">Session {} &middot; {} &middot; {} via {} &middot; temperature {} &middot; {} round(s){}</p>\n</header>\n",
        escape_html(&session.topic),
        escape_html(&session.id),
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        escape_html(&session.meta.model),
        session.meta.provider.as_str(),
        session.meta.model_params.temperature,
        session.rounds,
        if session.concluded { " &middot; concluded" } else { "" },
    );
    let mut current_round = 0;
    for turn in &session.turns {
        if session.rounds > 1 && turn.round != current_round {
            current_round = turn.round;
            let _ = writeln!(body, "<h2>Round {current_round}</h2>");
            for added in session.interjections.iter().filter(|i| i.round == current_round) {
                let _ = writeln!(body, "<p class=\"interjection\">You added: {}</p>", escape_html(&added.content));
            }
        }
        let _ = writeln!(
            body,
            "<section class=\"turn {}\">\n<h3>{} <span class=\"meta\">{}</span></h3>\n{}\n</section>",
            turn.role.as_str(),
            escape_html(&turn.agent),
            turn.created_at.format("%H:%M:%S"),
            escape_html(&turn.content)
        );
    }
    if let Some(conclusion) = session.turns.iter().rev().find(|t| t.role == Role::Judge) {
        let _ = writeln!(body, "<h2>Conclusion</h2>\n<div class=\"turn judge\">{}</div>", escape_html(&conclusion.content));
    }
    body.push_str("<p><a href=\"/\">&larr; all sessions</a></p>\n");
    page(&format!("Discussion: {}", session.topic), &body)
}

pub fn render_index(sessions: &[SessionSummary]) -> String {
    let mut body = String::from(
        "<header><h1>Multi-agent discussion</h1></header>\n\
         <form method=\"post\" action=\"/sessions\">\n\
         <input type=\"text\" name=\"topic\" placeholder=\"Topic to discuss\" required>\n\
         <button type=\"submit\">Start</button>\n</form>\n<h2>Sessions</h2>\n",
    );
    if sessions.is_empty() {
        body.push_str("<p class=\"meta\">No sessions yet.</p>\n");
    } else {
        body.push_str("<table>\n<tr><th>Created</th><th>Topic</th><th>Turns</th></tr>\n");
        for s in sessions {
            let _ = writeln!(
                body,
                "<tr><td>{}</td><td><a href=\"/sessions/{}\">{}</a></td><td>{}</td></tr>",
                s.created_at.format("%Y-%m-%d %H:%M"),
                escape_html(&s.id),
                escape_html(&s.topic),
                s.turns
            );
        }
        body.push_str("</table>\n");
    }
    page("Multi-agent discussion", &body)
}
