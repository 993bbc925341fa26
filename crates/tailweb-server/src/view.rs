//! Per-session view state: selected file, clear marker and pause.
//!
//! Clearing is view-local. The hub history is untouched; this session just
//! stops showing records at or below the marker.

use tailweb_core::HubEvent;
use tailweb_hub::DropNotice;

/// What one client is looking at.
#[derive(Clone, Debug, Default)]
pub struct ViewState {
    file: Option<String>,
    clear_marker: Option<u64>,
    last_seq: Option<u64>,
    paused: Option<DropNotice>,
}

impl ViewState {
    /// Empty view with nothing selected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to `file`. Resets pause and marker, then applies `after`.
    pub fn select(&mut self, file: &str, after: Option<u64>) {
        *self = Self {
            file: Some(file.to_owned()),
            clear_marker: after,
            ..Self::default()
        };
    }

    /// Forget the selection.
    pub fn deselect(&mut self) {
        *self = Self::default();
    }

    /// Selected file, if any.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// Current clear marker.
    pub fn clear_marker(&self) -> Option<u64> {
        self.clear_marker
    }

    /// Highest sequence number shown or skipped.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Whether forwarding is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    /// Hide everything up to `latest`, the newest sequence number published
    /// for the file. The marker never moves backwards.
    pub fn clear(&mut self, latest: Option<u64>) -> Option<u64> {
        let marker = [self.clear_marker, self.last_seq, latest]
            .into_iter()
            .flatten()
            .max();
        self.clear_marker = marker;
        if let Some(skipped) = self.paused.as_mut() {
            *skipped = DropNotice::default();
        }
        marker
    }

    /// Stop forwarding. Returns `false` if already paused.
    pub fn pause(&mut self) -> bool {
        if self.paused.is_some() {
            return false;
        }
        self.paused = Some(DropNotice::default());
        true
    }

    /// Resume forwarding. Returns what was skipped while paused, if anything.
    pub fn resume(&mut self) -> Option<DropNotice> {
        self.paused.take().filter(|skipped| skipped.count > 0)
    }

    /// Whether `event` should be forwarded. Skipped records are tallied while
    /// paused.
    pub fn admit(&mut self, event: &HubEvent) -> bool {
        let seq = match event {
            HubEvent::Fault(_) => return true,
            HubEvent::Line(line) => line.seq,
            HubEvent::Rotation(rotation) => rotation.seq,
        };
        if self.clear_marker.is_some_and(|marker| seq <= marker) {
            return false;
        }
        self.last_seq = Some(seq);
        if let Some(skipped) = self.paused.as_mut() {
            skipped.count += 1;
            match event {
                HubEvent::Line(_) => {
                    let _ = skipped.first_seq.get_or_insert(seq);
                    skipped.last_seq = Some(seq);
                }
                _ => skipped.rotations += 1,
            }
            return false;
        }
        true
    }

    /// Filter a backpressure drop notice. Returns `None` when the marker
    /// already hides everything it covers, or when paused (the notice is
    /// folded into the pause summary).
    pub fn admit_drop(&mut self, notice: DropNotice) -> Option<DropNotice> {
        let hidden = notice.rotations == 0
            && notice
                .last_seq
                .zip(self.clear_marker)
                .is_some_and(|(last, marker)| last <= marker);
        if hidden {
            return None;
        }
        if let Some(skipped) = self.paused.as_mut() {
            skipped.count += notice.count;
            skipped.rotations += notice.rotations;
            if skipped.first_seq.is_none() {
                skipped.first_seq = notice.first_seq;
            }
            if notice.last_seq.is_some() {
                skipped.last_seq = notice.last_seq;
            }
            return None;
        }
        if let Some(last) = notice.last_seq {
            self.last_seq = Some(self.last_seq.map_or(last, |seen| seen.max(last)));
        }
        Some(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tailweb_core::{FileSnapshot, LineRecord, RotationCause, RotationEvent};

    fn line(seq: u64) -> HubEvent {
        HubEvent::Line(LineRecord::decode(seq, format!("line {seq}").as_bytes()))
    }

    fn rotation(seq: u64) -> HubEvent {
        HubEvent::Rotation(RotationEvent {
            seq,
            old: None,
            new: FileSnapshot {
                fingerprint: None,
                size: 0,
                modified: None,
            },
            cause: RotationCause::Truncated,
            at: Utc::now(),
        })
    }

    fn admitted(view: &mut ViewState, events: &[HubEvent]) -> Vec<u64> {
        events
            .iter()
            .filter(|e| view.admit(e))
            .filter_map(HubEvent::seq)
            .collect()
    }

    #[test]
    fn fresh_view_admits_everything() {
        let mut view = ViewState::new();
        view.select("app", None);
        assert_eq!(admitted(&mut view, &[line(0), line(1)]), vec![0, 1]);
        assert_eq!(view.last_seq(), Some(1));
    }

    #[test]
    fn clear_hides_records_at_or_below_marker() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = admitted(&mut view, &[line(0), line(1)]);

        // Lines 2..=4 were published but are still queued.
        assert_eq!(view.clear(Some(4)), Some(4));
        assert_eq!(
            admitted(&mut view, &[line(2), line(3), line(4), line(5)]),
            vec![5]
        );
    }

    #[test]
    fn clear_uses_last_shown_when_hub_has_nothing_newer() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = admitted(&mut view, &[line(0), line(1), line(2)]);
        assert_eq!(view.clear(None), Some(2));
    }

    #[test]
    fn marker_never_moves_backwards() {
        let mut view = ViewState::new();
        view.select("app", Some(10));
        assert_eq!(view.clear(Some(3)), Some(10));
    }

    #[test]
    fn rotation_after_clear_is_shown() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = view.clear(Some(4));
        assert_eq!(admitted(&mut view, &[rotation(5), line(6)]), vec![5, 6]);
    }

    #[test]
    fn clear_between_rotation_and_next_line_hides_only_the_marker() {
        let mut view = ViewState::new();
        view.select("app", None);
        assert_eq!(admitted(&mut view, &[line(0), rotation(1)]), vec![0, 1]);
        assert_eq!(view.last_seq(), Some(1));

        assert_eq!(view.clear(Some(1)), Some(1));
        assert_eq!(admitted(&mut view, &[line(2)]), vec![2]);
    }

    #[test]
    fn select_resets_marker() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = view.clear(Some(9));
        view.select("db", None);
        assert_eq!(view.clear_marker(), None);
        assert_eq!(view.file(), Some("db"));
        assert!(view.admit(&line(0)));
    }

    #[test]
    fn after_from_reconnect_acts_as_marker() {
        let mut view = ViewState::new();
        view.select("app", Some(2));
        assert_eq!(admitted(&mut view, &[line(1), line(2), line(3)]), vec![3]);
    }

    #[test]
    fn pause_tallies_and_resume_summarises() {
        let mut view = ViewState::new();
        view.select("app", None);
        assert!(view.pause());
        assert!(!view.pause());
        assert!(admitted(&mut view, &[line(0), rotation(1), line(2)]).is_empty());

        let skipped = view.resume().unwrap();
        assert_eq!(skipped.count, 3);
        assert_eq!(skipped.first_seq, Some(0));
        assert_eq!(skipped.last_seq, Some(2));
        assert_eq!(skipped.rotations, 1);
        assert!(view.admit(&line(3)));
    }

    #[test]
    fn resume_without_skips_reports_nothing() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = view.pause();
        assert!(view.resume().is_none());
        assert!(!view.is_paused());
    }

    #[test]
    fn drop_notice_hidden_by_marker() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = view.clear(Some(20));
        let covered = DropNotice {
            count: 3,
            first_seq: Some(5),
            last_seq: Some(7),
            rotations: 0,
        };
        assert!(view.admit_drop(covered).is_none());

        let beyond = DropNotice {
            count: 3,
            first_seq: Some(19),
            last_seq: Some(21),
            rotations: 0,
        };
        assert_eq!(view.admit_drop(beyond), Some(beyond));
    }

    #[test]
    fn drop_notice_folds_into_pause() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = view.pause();
        let notice = DropNotice {
            count: 4,
            first_seq: Some(0),
            last_seq: Some(3),
            rotations: 0,
        };
        assert!(view.admit_drop(notice).is_none());
        let _ = view.admit(&line(4));
        let skipped = view.resume().unwrap();
        assert_eq!(skipped.count, 5);
        assert_eq!(skipped.first_seq, Some(0));
        assert_eq!(skipped.last_seq, Some(4));
    }

    #[test]
    fn faults_pass_while_paused() {
        let mut view = ViewState::new();
        view.select("app", None);
        let _ = view.pause();
        let fault = HubEvent::Fault(tailweb_core::FileFault {
            kind: tailweb_core::ErrorKind::FileNotFound,
            message: "waiting for file to appear".into(),
            at: Utc::now(),
        });
        assert!(view.admit(&fault));
    }
}
