use colored::*;

use crate::conversation::{percentage, Candidate, Role, TokenTrace, Turn, TurnStatus};

/// Colour a token by how confident the model was in it. Unknown confidence
/// is left plain.
pub fn apply_confidence_color(token: &str, probability: Option<f64>) -> String {
    match probability {
        Some(p) if p >= 0.9 => token.normal().to_string(),
        Some(p) if p >= 0.7 => token.on_blue().bright_white().to_string(),
        Some(p) if p >= 0.4 => token.on_yellow().black().to_string(),
        Some(p) if p >= 0.1 => token.on_red().bright_white().to_string(),
        Some(_) => token.on_bright_red().bright_white().to_string(),
        None => token.to_string(),
    }
}

/// `HH:MM:SS` (UTC) for a Unix-millisecond timestamp.
pub fn format_clock(timestamp_ms: u64) -> String {
    let secs = timestamp_ms / 1000;
    format!("{:02}:{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60, secs % 60)
}

fn label(turn: &Turn) -> ColoredString {
    match turn.role {
        Role::User => "You".bright_yellow().bold(),
        Role::Assistant => "AI".bright_cyan().bold(),
    }
}

/// Header line for a turn: label, index, time, candidate position, mean
/// confidence of the shown candidate, status.
pub fn turn_header(index: usize, turn: &Turn) -> String {
    let mut header = format!("{} #{} {}", label(turn), index, format_clock(turn.timestamp).dimmed());
    if turn.candidates.len() > 1 {
        header.push_str(&format!(
            " {}",
            format!("[{}/{}]", turn.active_candidate_index + 1, turn.candidates.len()).bright_magenta()
        ));
    }
    if let Some(mean) = turn.active_candidate().and_then(Candidate::mean_confidence) {
        header.push_str(&format!(" {}", format!("avg {:.1}%", mean * 100.0).dimmed()));
    }
    match turn.status {
        TurnStatus::Finalized => {}
        TurnStatus::Errored => header.push_str(&format!(" {}", "(error)".bright_red())),
        other => header.push_str(&format!(" {}", format!("({other})").dimmed())),
    }
    header
}

/// The turn's displayed content, coloured token by token when a probability
/// trace is available.
pub fn turn_body(turn: &Turn, heat: bool) -> String {
    match turn.active_candidate() {
        Some(candidate) if heat && !candidate.token_trace.is_empty() => render_heat(candidate),
        _ => turn.content.clone(),
    }
}

pub fn render_turn(index: usize, turn: &Turn, heat: bool) -> String {
    format!("{}\n{}\n", turn_header(index, turn), turn_body(turn, heat))
}

fn render_heat(candidate: &Candidate) -> String {
    candidate
        .token_trace
        .iter()
        .map(|t| apply_confidence_color(&t.token, t.chosen_probability()))
        .collect()
}

/// Numbered token list so a token can be picked for `/probs`.
pub fn render_tokens(candidate: &Candidate) -> String {
    if candidate.token_trace.is_empty() {
        return "No probability data available.".dimmed().to_string();
    }
    candidate
        .token_trace
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let conf = t
                .alternatives
                .get(&t.token)
                .map(|lp| percentage(*lp))
                .unwrap_or_else(|| "?".to_string());
            format!("{:>4}  {:<20} {}", i, format!("{:?}", t.token), conf)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Top-K alternatives for one token, most likely first; the emitted token is
/// marked.
pub fn render_probabilities(trace: &TokenTrace) -> String {
    if trace.alternatives.is_empty() {
        return "No probability data available.".dimmed().to_string();
    }
    let mut out = format!("{}\n", "Top Probabilities:".bright_green());
    for (token, logprob) in trace.ranked() {
        let marker = if token == trace.token { "›" } else { " " };
        out.push_str(&format!("{} {:<20} {:>8}\n", marker, format!("{token:?}"), percentage(logprob)));
    }
    out
}
