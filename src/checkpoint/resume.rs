//! Resume helpers: the resume brief, time-saved estimates, and the
//! continuation check run after a resumed task finishes.
//!
//! The continuation check is a heuristic. A genuine resume can legitimately
//! rediscover some earlier items; a high overlap only suggests the operation
//! started over instead of continuing.

use super::Checkpoint;
use crate::models::ScheduleEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

/// Collected items shown in a resume brief.
const PREVIEW_ITEMS: usize = 10;
/// Characters of partial result shown in a resume brief.
const PREVIEW_RESULT_CHARS: usize = 4000;
/// Characters of a single item shown in a resume brief.
const PREVIEW_ITEM_CHARS: usize = 200;
/// Overlap ratio above which a resumed run is flagged as a probable restart.
pub const RESTART_OVERLAP_THRESHOLD: f64 = 0.5;

/// Coarse estimate of the work a checkpoint represents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSavings {
    pub progress_pct: f64,
    /// Work already done (what resuming saves)
    #[serde(with = "crate::models::duration_secs")]
    pub time_invested: Duration,
    /// Work still ahead
    #[serde(with = "crate::models::duration_secs")]
    pub time_remaining: Duration,
}

impl TimeSavings {
    pub fn summary(&self) -> String {
        format!(
            "~{} saved at {:.0}%, ~{} remaining",
            format_duration(self.time_invested),
            self.progress_pct,
            format_duration(self.time_remaining)
        )
    }
}

/// Outcome of comparing a resumed run's items with the checkpoint's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationCheck {
    /// False when the run probably restarted from scratch
    pub verified: bool,
    /// Share of previously collected items found again (0.0-1.0)
    pub overlap_ratio: f64,
    pub overlapping_items: usize,
    pub previous_items: usize,
    pub new_items: usize,
    pub note: String,
}

/// Map a progress percentage onto the schedule's timeline.
///
/// Points between schedule entries are linearly interpolated; past the last
/// entry the average pace of the schedule is extrapolated.
pub fn estimate_savings(schedule: &[ScheduleEntry], progress_pct: f64) -> TimeSavings {
    let pct = progress_pct.clamp(0.0, 100.0);
    let invested = elapsed_at(schedule, pct);
    let total = elapsed_at(schedule, 100.0).max(invested);

    TimeSavings {
        progress_pct: pct,
        time_invested: Duration::from_secs_f64(invested),
        time_remaining: Duration::from_secs_f64(total - invested),
    }
}

fn elapsed_at(schedule: &[ScheduleEntry], pct: f64) -> f64 {
    let mut points: Vec<(f64, f64)> = schedule
        .iter()
        .filter(|e| e.progress_pct > 0.0)
        .map(|e| (e.progress_pct, e.elapsed_sec as f64))
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut prev = (0.0_f64, 0.0_f64);
    for &(p, secs) in &points {
        if pct <= p {
            let span = p - prev.0;
            if span <= f64::EPSILON {
                return secs;
            }
            return prev.1 + (secs - prev.1) * (pct - prev.0) / span;
        }
        prev = (p, secs);
    }

    // Beyond the last point: keep the schedule's average pace.
    if prev.0 > 0.0 {
        prev.1 / prev.0 * pct
    } else {
        0.0
    }
}

/// Render the brief handed to the operation instead of the original query.
pub fn render_resume_context(checkpoint: &Checkpoint) -> String {
    let age = checkpoint.age();
    let phase = checkpoint
        .metadata
        .extra
        .get("phase")
        .and_then(Value::as_str)
        .unwrap_or("unknown phase");

    let mut brief = String::new();
    brief.push_str("## RESUMING INTERRUPTED TASK\n\n");
    brief.push_str(&format!(
        "This task was interrupted at {:.0}% completion ({phase}). \
         Continue from where it stopped. Do NOT restart from scratch and do not \
         repeat work that is already summarized below.\n\n",
        checkpoint.progress_pct
    ));

    brief.push_str("### Original query\n\n");
    brief.push_str(checkpoint.query.trim());
    brief.push_str("\n\n");

    brief.push_str("### Progress so far\n\n");
    brief.push_str(&format!("- Completion: {:.0}%\n", checkpoint.progress_pct));
    brief.push_str(&format!(
        "- Checkpoint saved: {} ({} ago)\n",
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        format_duration(age)
    ));
    brief.push_str(&format!(
        "- Items collected: {}\n\n",
        checkpoint.collected_items.len()
    ));

    if !checkpoint.partial_result.is_null() {
        let rendered = match &checkpoint.partial_result {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        brief.push_str("### Partial result\n\n");
        brief.push_str(&truncate_chars(&rendered, PREVIEW_RESULT_CHARS));
        brief.push_str("\n\n");
    }

    if !checkpoint.collected_items.is_empty() {
        let shown = checkpoint.collected_items.len().min(PREVIEW_ITEMS);
        brief.push_str(&format!(
            "### Previously collected items (showing {shown} of {})\n\n",
            checkpoint.collected_items.len()
        ));
        for item in checkpoint.collected_items.iter().take(PREVIEW_ITEMS) {
            brief.push_str("- ");
            brief.push_str(&truncate_chars(&describe_item(item), PREVIEW_ITEM_CHARS));
            brief.push('\n');
        }
        brief.push('\n');
    }

    brief.push_str("### Instructions\n\n");
    brief.push_str(
        "1. Treat the partial result and collected items above as already done.\n\
         2. Focus on the remaining work needed to answer the original query.\n\
         3. Only revisit earlier items when new evidence contradicts them.\n",
    );
    brief
}

/// Compare a finished run's items with those recorded in the checkpoint.
pub fn check_continuation(checkpoint: &Checkpoint, new_items: &[Value]) -> ContinuationCheck {
    let previous: HashSet<String> = checkpoint.collected_items.iter().map(item_key).collect();
    let current: HashSet<String> = new_items.iter().map(item_key).collect();

    let overlapping = previous.intersection(&current).count();
    let ratio = if previous.is_empty() {
        0.0
    } else {
        overlapping as f64 / previous.len() as f64
    };
    let verified = ratio <= RESTART_OVERLAP_THRESHOLD;

    let note = if previous.is_empty() {
        "checkpoint had no collected items; nothing to compare".to_string()
    } else if verified {
        format!(
            "{overlapping} of {} earlier items seen again ({:.0}%); run continued",
            previous.len(),
            ratio * 100.0
        )
    } else {
        format!(
            "{overlapping} of {} earlier items seen again ({:.0}%); run probably restarted",
            previous.len(),
            ratio * 100.0
        )
    };

    ContinuationCheck {
        verified,
        overlap_ratio: ratio,
        overlapping_items: overlapping,
        previous_items: previous.len(),
        new_items: current.len(),
        note,
    }
}

/// Identity of a collected item for overlap purposes.
pub fn item_key(item: &Value) -> String {
    match item {
        Value::String(s) => normalize(s),
        Value::Object(map) => ["url", "id", "source", "link"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(normalize)
            .unwrap_or_else(|| item.to_string()),
        other => other.to_string(),
    }
}

fn normalize(s: &str) -> String {
    s.trim().trim_end_matches('/').to_lowercase()
}

fn describe_item(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let title = map.get("title").and_then(Value::as_str);
            let key = item_key(item);
            match title {
                Some(t) => format!("{t} ({key})"),
                None => key,
            }
        }
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}... [truncated]", &s[..idx]),
        None => s.to_string(),
    }
}

/// Compact human duration (`45s`, `12m`, `3h 5m`).
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMetadata, CHECKPOINT_VERSION};
    use chrono::Utc;
    use serde_json::json;

    fn schedule() -> Vec<ScheduleEntry> {
        vec![
            ScheduleEntry::new(120, 10.0, "initial", true),
            ScheduleEntry::new(300, 25.0, "gather", true),
            ScheduleEntry::new(600, 50.0, "analysis", true),
        ]
    }

    fn checkpoint(items: Vec<Value>) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            task_name: "market-overview".to_string(),
            scope_id: "phase-1".to_string(),
            query: "Summarize the EV battery market".to_string(),
            created_at: Utc::now(),
            progress_pct: 30.0,
            resumable: true,
            partial_result: json!("Draft: lithium supply is tight"),
            collected_items: items,
            metadata: CheckpointMetadata::default(),
        }
    }

    #[test]
    fn test_estimate_interpolates_between_points() {
        let s = estimate_savings(&schedule(), 25.0);
        assert_eq!(s.time_invested, Duration::from_secs(300));
        // 100% extrapolated at 600s per 50% -> 1200s total.
        assert_eq!(s.time_remaining, Duration::from_secs(900));

        let s = estimate_savings(&schedule(), 5.0);
        assert_eq!(s.time_invested, Duration::from_secs(60));
    }

    #[test]
    fn test_estimate_zero_progress_saves_nothing() {
        let s = estimate_savings(&schedule(), 0.0);
        assert_eq!(s.time_invested, Duration::ZERO);
        assert!(s.time_remaining > Duration::ZERO);
    }

    #[test]
    fn test_resume_context_contains_brief_sections() {
        let items: Vec<Value> = (0..15)
            .map(|i| json!({"url": format!("https://example.com/{i}"), "title": format!("Doc {i}")}))
            .collect();
        let brief = render_resume_context(&checkpoint(items));

        assert!(brief.contains("RESUMING INTERRUPTED TASK"));
        assert!(brief.contains("Do NOT restart"));
        assert!(brief.contains("Summarize the EV battery market"));
        assert!(brief.contains("lithium supply is tight"));
        assert!(brief.contains("showing 10 of 15"));
        assert!(brief.contains("Doc 9 (https://example.com/9)"));
        assert!(!brief.contains("Doc 10 "));
    }

    #[test]
    fn test_low_overlap_is_verified() {
        let cp = checkpoint(vec![json!("https://a.com"), json!("https://b.com")]);
        let check = check_continuation(&cp, &[json!("https://b.com/"), json!("https://c.com")]);
        assert!(check.verified);
        assert_eq!(check.overlapping_items, 1);
        assert!((check.overlap_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_high_overlap_flags_restart() {
        let cp = checkpoint(vec![
            json!({"url": "https://a.com"}),
            json!({"url": "https://b.com"}),
            json!({"url": "https://c.com"}),
        ]);
        let check = check_continuation(
            &cp,
            &[
                json!({"url": "https://A.com"}),
                json!({"url": "https://b.com"}),
                json!({"url": "https://d.com"}),
            ],
        );
        assert!(!check.verified);
        assert!(check.note.contains("probably restarted"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééééé";
        assert_eq!(truncate_chars(s, 2), "éé... [truncated]");
        assert_eq!(truncate_chars(s, 10), s);
    }
}
