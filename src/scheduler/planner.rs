/// Intra-file Clip Planner
///
/// Expands one source file into an ordered batch of clip plans. A file
/// yields either a single randomly-seeked clip or several clips separated
/// by randomly sized gaps that each respect the configured minimum, with
/// total clip time capped both by packing and by a percentage of the file
/// duration.
use std::path::Path;

use rand::Rng;
use thiserror::Error;

use crate::backend::MediaInfo;
use crate::scheduler::clip::ClipPlan;
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{path} is {duration_ms} ms long, below the {min_ms} ms clip minimum")]
    TooShort { path: String, duration_ms: u64, min_ms: u64 },
    /// Slicing arithmetic went negative; emitting clips anyway would
    /// overlap them or produce negative durations.
    #[error("{path}: leftover space after minimum gaps is negative ({leftover_ms} ms)")]
    NegativeLeftover { path: String, leftover_ms: i64 },
}

/// Plan the clip batch for `path`, whose probed metadata is `media`.
pub fn plan_clips<R: Rng>(
    path: &Path,
    media: &MediaInfo,
    settings: &Settings,
    rng: &mut R,
) -> Result<Vec<ClipPlan>, PlanError> {
    let file_ms = media.duration_ms;
    if file_ms < settings.clip_duration_min_ms {
        return Err(PlanError::TooShort {
            path: path.display().to_string(),
            duration_ms: file_ms,
            min_ms: settings.clip_duration_min_ms,
        });
    }

    let target_ms = settings.clip_duration_ms;
    let inter = settings.inter_transition_ms;
    let intra = settings.intra_transition_ms;
    let with_inter = target_ms + 2 * inter;
    let with_intra = target_ms + 2 * intra;

    // Obvious single-clip case: one clip per file, or no room for a second
    // clip on top of the first.
    if settings.clips_per_file <= 1 || file_ms < with_inter + target_ms {
        return Ok(vec![single_clip(path, media, settings, rng)]);
    }

    // Clip count: packing cap (how many clip+transition+gap blocks fit after
    // the first clip) and the percent-of-duration cap, then the preset cap.
    let after_first = file_ms - with_inter;
    let max_by_gaps = 1 + after_first / (with_intra + settings.intra_file_min_gap_ms);
    let max_by_percent = ((file_ms as f64 * settings.clips_max_percent) / with_intra as f64) as u64;
    let clip_count = max_by_gaps.min(max_by_percent).min(settings.clips_per_file as u64);
    if clip_count <= 1 {
        return Ok(vec![single_clip(path, media, settings, rng)]);
    }

    // Space layout: count+1 spaces around the clips. The first and last may
    // be zero-width, interior spaces carry the minimum gap floor.
    let space_count = clip_count as usize + 1;
    let gap_count = space_count as u64 - 2;
    let clips_total = with_inter + (clip_count - 1) * with_intra;
    let total_space = file_ms as i64 - clips_total as i64;
    let free_space = total_space - (gap_count * settings.intra_file_min_gap_ms) as i64;
    if free_space < 0 {
        return Err(PlanError::NegativeLeftover {
            path: path.display().to_string(),
            leftover_ms: free_space,
        });
    }

    let weights: Vec<f64> = (0..space_count).map(|_| rng.gen::<f64>()).collect();
    let weight_sum: f64 = weights.iter().sum::<f64>().max(f64::MIN_POSITIVE);
    let mut spaces: Vec<f64> =
        weights.iter().map(|w| w / weight_sum * free_space as f64).collect();
    for space in spaces.iter_mut().take(space_count - 1).skip(1) {
        *space += settings.intra_file_min_gap_ms as f64;
    }

    let mut plans = Vec::with_capacity(clip_count as usize);
    let mut cursor = 0.0_f64;
    for (i, space) in spaces.iter().take(space_count - 1).enumerate() {
        cursor += space;
        let fadein_ms = if i == 0 { inter } else { intra };
        let fadeout_ms = if i == clip_count as usize - 1 { inter } else { intra };
        let duration_ms = target_ms + fadein_ms + fadeout_ms;
        plans.push(ClipPlan {
            path: path.to_path_buf(),
            seek_ms: cursor.floor() as u64,
            duration_ms,
            fadein_ms,
            fadeout_ms,
            source_width: Some(media.width),
            source_height: Some(media.height),
            has_audio: media.has_audio,
        });
        cursor += duration_ms as f64;
    }

    Ok(plans)
}

fn single_clip<R: Rng>(
    path: &Path,
    media: &MediaInfo,
    settings: &Settings,
    rng: &mut R,
) -> ClipPlan {
    let inter = settings.inter_transition_ms;
    let percent_cap = (media.duration_ms as f64 * settings.clip_duration_max_percent) as u64;
    let duration_ms = (settings.clip_duration_ms + 2 * inter)
        .min(media.duration_ms)
        .min(percent_cap.max(1));
    let slack = media.duration_ms - duration_ms;
    let seek_ms = if slack == 0 { 0 } else { rng.gen_range(0..=slack) };
    ClipPlan {
        path: path.to_path_buf(),
        seek_ms,
        duration_ms,
        fadein_ms: inter,
        fadeout_ms: inter,
        source_width: Some(media.width),
        source_height: Some(media.height),
        has_audio: media.has_audio,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn media(duration_ms: u64) -> MediaInfo {
        MediaInfo { duration_ms, width: 1920, height: 1080, has_audio: true }
    }

    fn settings() -> Settings {
        Settings {
            clip_duration_ms: 10_000,
            clip_duration_min_ms: 5_000,
            inter_transition_ms: 2_000,
            intra_transition_ms: 1_000,
            intra_file_min_gap_ms: 3_000,
            clips_max_percent: 0.8,
            clips_per_file: 1,
            ..Default::default()
        }
    }

    #[test]
    fn thirty_second_file_single_clip_bounds() {
        // 30 s file, 10 s clips, 2 s inter transitions, one clip per file.
        let s = settings();
        let media = media(30_000);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plans = plan_clips(Path::new("a.mp4"), &media, &s, &mut rng).unwrap();
            assert_eq!(plans.len(), 1);
            let p = &plans[0];
            assert!(p.duration_ms <= 14_000, "duration {} exceeds 14 s", p.duration_ms);
            assert!(p.seek_ms <= 16_000, "seek {} outside [0, 16 s]", p.seek_ms);
            assert_eq!(p.fadein_ms, 2_000);
            assert_eq!(p.fadeout_ms, 2_000);
        }
    }

    #[test]
    fn short_file_is_used_whole() {
        let s = settings();
        let mut rng = StdRng::seed_from_u64(1);
        let plans = plan_clips(Path::new("a.mp4"), &media(8_000), &s, &mut rng).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].duration_ms, 8_000);
        assert_eq!(plans[0].seek_ms, 0);
    }

    #[test]
    fn too_short_file_is_rejected() {
        let s = settings();
        let mut rng = StdRng::seed_from_u64(1);
        let err = plan_clips(Path::new("a.mp4"), &media(3_000), &s, &mut rng).unwrap_err();
        assert!(matches!(err, PlanError::TooShort { .. }));
    }

    #[test]
    fn multi_clip_fits_inside_file_with_minimum_gaps() {
        let mut s = settings();
        s.clips_per_file = 4;
        let media = media(120_000);

        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plans = plan_clips(Path::new("a.mp4"), &media, &s, &mut rng).unwrap();
            assert!(plans.len() > 1, "long file should yield several clips");

            let mut prev_end = 0_u64;
            for (i, p) in plans.iter().enumerate() {
                assert!(p.seek_ms >= prev_end, "clip {i} overlaps its predecessor");
                if i > 0 {
                    let gap = p.seek_ms - prev_end;
                    assert!(
                        gap >= s.intra_file_min_gap_ms - 1,
                        "interior gap {gap} below the {} ms minimum",
                        s.intra_file_min_gap_ms
                    );
                }
                prev_end = p.seek_ms + p.duration_ms;
            }
            assert!(
                prev_end <= media.duration_ms,
                "clips spill past the end of the file ({prev_end} > {})",
                media.duration_ms
            );
        }
    }

    #[test]
    fn multi_clip_edges_use_inter_transitions_outside() {
        let mut s = settings();
        s.clips_per_file = 3;
        let mut rng = StdRng::seed_from_u64(5);
        let plans = plan_clips(Path::new("a.mp4"), &media(120_000), &s, &mut rng).unwrap();
        assert!(plans.len() >= 2);

        let first = plans.first().unwrap();
        let last = plans.last().unwrap();
        assert_eq!(first.fadein_ms, s.inter_transition_ms);
        assert_eq!(first.fadeout_ms, s.intra_transition_ms);
        assert_eq!(last.fadein_ms, s.intra_transition_ms);
        assert_eq!(last.fadeout_ms, s.inter_transition_ms);
        for p in &plans[1..plans.len() - 1] {
            assert_eq!(p.fadein_ms, s.intra_transition_ms);
            assert_eq!(p.fadeout_ms, s.intra_transition_ms);
        }
    }

    #[test]
    fn percent_cap_limits_clip_count() {
        let mut s = settings();
        s.clips_per_file = 10;
        s.clips_max_percent = 0.25;
        let media = media(120_000);
        // 25% of 120 s is 30 s; a 12 s clip block fits at most twice.
        let mut rng = StdRng::seed_from_u64(2);
        let plans = plan_clips(Path::new("a.mp4"), &media, &s, &mut rng).unwrap();
        assert!(plans.len() <= 2, "percent cap allows at most 2 clips, got {}", plans.len());
    }

    #[test]
    fn preset_cap_limits_clip_count() {
        let mut s = settings();
        s.clips_per_file = 2;
        let mut rng = StdRng::seed_from_u64(3);
        let plans = plan_clips(Path::new("a.mp4"), &media(600_000), &s, &mut rng).unwrap();
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn single_clip_duration_percent_cap_applies() {
        let mut s = settings();
        s.clip_duration_max_percent = 0.5;
        let mut rng = StdRng::seed_from_u64(4);
        let plans = plan_clips(Path::new("a.mp4"), &media(20_000), &s, &mut rng).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].duration_ms, 10_000, "capped to 50% of a 20 s file");
    }
}
