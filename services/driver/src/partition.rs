//! Frame-range partitioning.
//!
//! Two operations: the forward split of a fresh project into
//! `framesPerMachine`-sized chunks, and the residual split of a failing job's
//! unrendered frames into maximal contiguous runs. Contiguous runs let a
//! renderer reuse loaded scene state, and fewer sub-jobs mean fewer machines
//! to set up.

use std::collections::BTreeSet;

use drender_protocol::{FrameRange, Job, JobAction, JobDraft, MessageQ, Project};

/// Splits `range` into chunks of at most `frames_per_machine` frames.
///
/// Chunks are contiguous, ascending, and cover the range exactly; the last
/// chunk is clamped to the range end. `frames_per_machine` must be at least 1
/// (validated at the request boundary).
pub fn split_range(range: FrameRange, frames_per_machine: u32) -> Vec<FrameRange> {
    debug_assert!(frames_per_machine >= 1);

    let mut chunks = Vec::new();
    let mut cursor = range.start;
    loop {
        let chunk_end = cursor
            .saturating_add(frames_per_machine - 1)
            .min(range.end);
        chunks.push(FrameRange::new(cursor, chunk_end));
        if chunk_end == range.end {
            break;
        }
        cursor = chunk_end + 1;
    }
    chunks
}

/// Returns the maximal contiguous runs of frames in `range` absent from
/// `rendered`, in ascending order.
///
/// A fully rendered range yields no runs; an untouched range yields one run
/// equal to `range`.
pub fn unrendered_runs(range: FrameRange, rendered: &BTreeSet<u32>) -> Vec<FrameRange> {
    let mut runs = Vec::new();
    let mut run_start: Option<u32> = None;

    for frame in range.iter() {
        if rendered.contains(&frame) {
            if let Some(start) = run_start.take() {
                runs.push(FrameRange::new(start, frame - 1));
            }
        } else if run_start.is_none() {
            run_start = Some(frame);
        }
    }
    if let Some(start) = run_start {
        runs.push(FrameRange::new(start, range.end));
    }
    runs
}

/// Builds the initial job drafts for a project.
///
/// One draft per chunk; the output URI stays unset until the bucket exists.
pub fn initial_drafts(project: &Project, message_q: &MessageQ) -> Vec<JobDraft> {
    let range = FrameRange::new(project.start_frame, project.end_frame);
    split_range(range, project.frames_per_machine)
        .into_iter()
        .map(|chunk| JobDraft {
            project_id: project.id.clone(),
            start_frame: chunk.start,
            end_frame: chunk.end,
            source: project.source.clone(),
            output_uri: None,
            message_q: Some(message_q.clone()),
            action: JobAction::Start,
        })
        .collect()
}

/// Builds replacement drafts covering the unrendered frames of a failing job.
///
/// Each draft inherits the job's source, project, output URI, and broker
/// channel; the instance binding is left to the driver once a machine exists.
pub fn residual_drafts(job: &Job, rendered: &BTreeSet<u32>) -> Vec<JobDraft> {
    unrendered_runs(job.frames(), rendered)
        .into_iter()
        .map(|run| JobDraft {
            project_id: job.project_id.clone(),
            start_frame: run.start,
            end_frame: run.end,
            source: job.source.clone(),
            output_uri: job.output_uri.clone(),
            message_q: job.message_q.clone(),
            action: JobAction::Start,
        })
        .collect()
}
