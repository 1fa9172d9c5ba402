//! proctor_replay - Replay a recorded exam session through the monitor
//!
//! Reads a JSON script of timed host events, drives an `ExamMonitor` on a
//! manual clock and prints every callback plus the final ledger summary as
//! JSON. Used to reproduce escalation decisions offline.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use exam_integrity_kernel::sensors::{HostRequest, InferenceTicket};
use exam_integrity_kernel::storage::SharedProgressStore;
use exam_integrity_kernel::violation::{CandidateViolation, LedgerSummary};
use exam_integrity_kernel::{
    Clock, ExamMonitor, ExamStage, FaceDetection, InMemoryProgressStore, IntegrityConfig,
    ManualClock, MonitorEvent, RecordingCallbacks, SensorInput, SensorKind, SqliteProgressStore,
    SubStage, SubmitReason, ViolationKind,
};

#[derive(Parser, Debug)]
#[command(
    name = "proctor_replay",
    about = "Replay a scripted exam session and print monitor decisions"
)]
struct Args {
    /// Path to the JSON replay script
    #[arg(long, value_name = "PATH")]
    script: String,

    /// Exam id used for persisted progress
    #[arg(long, default_value = "replay")]
    exam_id: String,

    /// Persist progress to this SQLite file instead of memory
    #[arg(long, env = "EXAM_INTEGRITY_DB_PATH")]
    db: Option<String>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Deserialize)]
struct ReplayScript {
    #[serde(default)]
    start_ms: u64,
    /// Face descriptor captured as the reference and presented for
    /// verification. Omit to replay a session that is already monitoring.
    #[serde(default)]
    reference: Option<Vec<f32>>,
    steps: Vec<ReplayStep>,
}

#[derive(Debug, Deserialize)]
struct ReplayStep {
    at_ms: u64,
    #[serde(flatten)]
    action: ReplayAction,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ReplayAction {
    Input { input: SensorInput },
    /// Answers the most recent frame capture request.
    Faces { faces: Vec<FaceDetection> },
    /// Clipboard content returned for the most recent read request.
    Clipboard { content: Option<String> },
    Violation {
        kind: ViolationKind,
        source: SensorKind,
    },
    CompleteSubStage { sub_stage: SubStage },
    Submit,
    Tick,
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    exam_id: String,
    stage: ExamStage,
    submit_reason: Option<SubmitReason>,
    events: Vec<MonitorEvent>,
    summary: LedgerSummary,
}

fn reference_faces(descriptor: &[f32]) -> Vec<FaceDetection> {
    vec![FaceDetection {
        descriptor: descriptor.to_vec(),
        score: 1.0,
        ..FaceDetection::default()
    }]
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read replay script {}", args.script))?;
    let script: ReplayScript = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid replay script {}: {}", args.script, e))?;

    let config = IntegrityConfig::load()?;
    let store: SharedProgressStore = match args.db.as_deref() {
        Some(path) => Arc::new(SqliteProgressStore::open(path)?),
        None => InMemoryProgressStore::shared(),
    };
    let clock = ManualClock::new(script.start_ms);
    let mut monitor = ExamMonitor::new(
        &args.exam_id,
        config.monitor,
        store,
        Arc::new(clock.clone()),
        RecordingCallbacks::new(),
    )?;

    match (&script.reference, monitor.stage()) {
        (Some(descriptor), ExamStage::Identity) => {
            monitor.capture_reference(&reference_faces(descriptor))?;
            let result = monitor.verify_identity(&reference_faces(descriptor))?;
            if !result.matched {
                return Err(anyhow!(
                    "reference did not verify (distance {:.3})",
                    result.distance
                ));
            }
        }
        (_, ExamStage::Monitoring) => monitor.start_monitoring()?,
        (None, ExamStage::Identity) => {
            return Err(anyhow!("script has no reference and the exam is not verified"))
        }
        (_, ExamStage::Submitted) => log::warn!("exam {} is already submitted", args.exam_id),
    }

    let mut last_ticket: Option<InferenceTicket> = None;
    let mut clipboard_pending = false;
    for step in script.steps {
        if step.at_ms < clock.now_ms() {
            return Err(anyhow!(
                "replay steps must be in time order ({} after {})",
                step.at_ms,
                clock.now_ms()
            ));
        }
        clock.set(step.at_ms);
        for request in monitor.tick() {
            match request {
                HostRequest::CaptureFrame { ticket } => last_ticket = Some(ticket),
                HostRequest::ReadClipboard => clipboard_pending = true,
            }
        }

        match step.action {
            ReplayAction::Input { input } => {
                monitor.handle(input);
            }
            ReplayAction::Faces { faces } => match last_ticket.take() {
                Some(ticket) => {
                    monitor.complete_face_inference(ticket, Ok(faces));
                }
                None => log::warn!("faces at {} ms with no pending capture", step.at_ms),
            },
            ReplayAction::Clipboard { content } => {
                if !clipboard_pending {
                    log::warn!("clipboard at {} ms with no pending read", step.at_ms);
                }
                clipboard_pending = false;
                monitor.handle(SensorInput::ClipboardRead { content });
            }
            ReplayAction::Violation { kind, source } => {
                monitor.log_violation(CandidateViolation::new(kind, source));
            }
            ReplayAction::CompleteSubStage { sub_stage } => {
                if let Err(e) = monitor.complete_sub_stage(sub_stage, None) {
                    log::warn!("complete {} refused: {:#}", sub_stage.as_str(), e);
                }
            }
            ReplayAction::Submit => {
                monitor.submit()?;
            }
            ReplayAction::Tick => {}
        }
    }

    let report = ReplayReport {
        exam_id: args.exam_id,
        stage: monitor.stage(),
        submit_reason: monitor.session().submit_reason,
        summary: monitor.summary(),
        events: monitor.callbacks().events.clone(),
    };
    let out = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", out);
    Ok(())
}
