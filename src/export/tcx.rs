/// Training Center XML export
///
/// Each workout becomes one `Activity` with a single `Lap`. Samples become
/// `Trackpoint`s; heart rate is only written for samples that had one.
use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{WorkoutRecord, WorkoutSample};
use crate::utils::format_iso_millis;

const TCX_NAMESPACE: &str = "http://www.garmin.com/xmlschemas/TrainingCenterDatabase/v2";

pub fn build_tcx(workouts: &[WorkoutRecord], samples: &HashMap<i64, Vec<WorkoutSample>>) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(out, "<TrainingCenterDatabase xmlns=\"{}\">", TCX_NAMESPACE);
    out.push_str("  <Activities>\n");

    for w in workouts {
        let start = format_iso_millis(w.start_time_millis);
        out.push_str("    <Activity Sport=\"Other\">\n");
        let _ = writeln!(out, "      <Id>{}</Id>", start);
        let _ = writeln!(out, "      <Lap StartTime=\"{}\">", start);
        let _ = writeln!(
            out,
            "        <TotalTimeSeconds>{}</TotalTimeSeconds>",
            w.duration_seconds
        );
        out.push_str("        <Track>\n");

        for s in samples.get(&w.id).map(Vec::as_slice).unwrap_or_default() {
            out.push_str("          <Trackpoint>");
            let _ = write!(out, "<Time>{}</Time>", format_iso_millis(s.timestamp_millis));
            if let Some(bpm) = s.heart_rate {
                let _ = write!(out, "<HeartRateBpm><Value>{}</Value></HeartRateBpm>", bpm);
            }
            out.push_str("</Trackpoint>\n");
        }

        out.push_str("        </Track>\n");
        out.push_str("      </Lap>\n");
        if let Some(jump_time) = w.jump_time_seconds {
            let _ = writeln!(out, "      <Notes>Jump time: {}s</Notes>", jump_time);
        }
        out.push_str("    </Activity>\n");
    }

    out.push_str("  </Activities>\n");
    out.push_str("</TrainingCenterDatabase>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workout(id: i64, start_time_millis: i64) -> WorkoutRecord {
        WorkoutRecord {
            id,
            start_time_millis,
            duration_seconds: 300,
            avg_heart_rate: None,
            jump_count: None,
            jumps_per_minute: None,
            jump_time_seconds: None,
        }
    }

    fn sample(timestamp_millis: i64, heart_rate: Option<u16>) -> WorkoutSample {
        WorkoutSample {
            workout_id: 1,
            timestamp_millis,
            heart_rate,
            jump_count: 0,
        }
    }

    #[test]
    fn document_structure() {
        let w = workout(1, 1_700_000_000_000);
        let samples = HashMap::from([(1, vec![sample(1_700_000_005_000, Some(120))])]);
        let tcx = build_tcx(&[w], &samples);

        assert!(tcx.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(tcx.contains("<TrainingCenterDatabase"));
        assert!(tcx.contains("<Activities>"));
        assert!(tcx.contains("<Activity Sport=\"Other\">"));
        assert!(tcx.contains("<Lap StartTime="));
        assert!(tcx.contains("<Track>"));
        assert!(tcx.contains("<Trackpoint>"));
        assert!(tcx.trim_end().ends_with("</TrainingCenterDatabase>"));
    }

    #[test]
    fn timestamps_are_iso_utc() {
        let w = workout(1, 1_700_000_000_000);
        let samples = HashMap::from([(1, vec![sample(1_700_000_005_000, Some(120))])]);
        let tcx = build_tcx(&[w], &samples);

        assert!(tcx.contains("<Id>2023-11-14T22:13:20.000Z</Id>"));
        assert!(tcx.contains("<Lap StartTime=\"2023-11-14T22:13:20.000Z\">"));
        assert!(tcx.contains("<Time>2023-11-14T22:13:25.000Z</Time>"));
    }

    #[test]
    fn heart_rate_only_when_present() {
        let w = workout(1, 1_700_000_000_000);
        let samples = HashMap::from([(
            1,
            vec![
                sample(1_700_000_005_000, Some(145)),
                sample(1_700_000_010_000, None),
            ],
        )]);
        let tcx = build_tcx(&[w], &samples);

        assert!(tcx.contains("<HeartRateBpm><Value>145</Value></HeartRateBpm>"));
        assert_eq!(tcx.matches("<HeartRateBpm>").count(), 1);
        assert_eq!(tcx.matches("<Trackpoint>").count(), 2);
    }

    #[test]
    fn one_activity_per_workout() {
        let workouts = [workout(1, 1_700_000_000_000), workout(2, 1_700_100_000_000)];
        let tcx = build_tcx(&workouts, &HashMap::new());

        assert_eq!(tcx.matches("<Activity Sport=\"Other\">").count(), 2);
        assert_eq!(tcx.matches("</Activity>").count(), 2);
    }

    #[test]
    fn no_samples_gives_empty_track() {
        let tcx = build_tcx(&[workout(1, 1_700_000_000_000)], &HashMap::from([(1, vec![])]));

        assert!(tcx.contains("<Track>"));
        assert!(tcx.contains("</Track>"));
        assert!(!tcx.contains("<Trackpoint>"));
    }

    #[test]
    fn total_time_is_duration() {
        let mut w = workout(1, 1_700_000_000_000);
        w.duration_seconds = 1234;
        let tcx = build_tcx(&[w], &HashMap::new());
        assert!(tcx.contains("<TotalTimeSeconds>1234</TotalTimeSeconds>"));
    }

    #[test]
    fn notes_only_with_jump_time() {
        let mut w = workout(1, 1_700_000_000_000);
        assert!(!build_tcx(&[w.clone()], &HashMap::new()).contains("<Notes>"));

        w.jump_time_seconds = Some(90);
        assert!(build_tcx(&[w], &HashMap::new()).contains("<Notes>Jump time: 90s</Notes>"));
    }
}
