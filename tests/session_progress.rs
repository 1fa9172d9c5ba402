use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use exam_integrity_kernel::error::integrity_error;
use exam_integrity_kernel::storage::{progress_key, SharedProgressStore};
use exam_integrity_kernel::{
    ExamSessionStateMachine, ExamStage, IntegrityError, ProgressStore, SqliteProgressStore,
    SubStage, SubmitReason,
};

fn sqlite(path: &str) -> Result<SharedProgressStore> {
    Ok(Arc::new(SqliteProgressStore::open(path)?))
}

#[test]
fn progress_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("progress.db");
    let path = path.to_str().expect("utf-8 path");

    {
        let mut machine = ExamSessionStateMachine::open(
            "exam-88",
            SubStage::DEFAULT_ORDER.to_vec(),
            sqlite(path)?,
            1_000,
        )?;
        machine.complete_identity()?;
        assert!(!machine.complete_sub_stage(SubStage::Mcq, Some(json!({"q1": "b"})))?);
        assert_eq!(machine.current_sub_stage(), Some(SubStage::Coding));
    }

    let mut machine = ExamSessionStateMachine::open(
        "exam-88",
        SubStage::DEFAULT_ORDER.to_vec(),
        sqlite(path)?,
        9_000,
    )?;
    let session = machine.session();
    assert_eq!(session.stage, ExamStage::Monitoring);
    assert_eq!(session.start_time_ms, 1_000);
    assert!(session.is_completed(SubStage::Mcq));
    assert_eq!(
        session.stage_progress[&SubStage::Mcq].data,
        Some(json!({"q1": "b"}))
    );
    assert_eq!(machine.current_sub_stage(), Some(SubStage::Coding));

    // Going back to a completed sub-stage is allowed; skipping ahead is not.
    machine.select_sub_stage(SubStage::Mcq)?;
    let err = machine
        .select_sub_stage(SubStage::Feedback)
        .expect_err("locked");
    assert!(matches!(
        integrity_error(&err),
        Some(IntegrityError::StageLocked { .. })
    ));
    Ok(())
}

#[test]
fn corrupt_progress_starts_fresh() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("progress.db");
    let path = path.to_str().expect("utf-8 path");
    let store = sqlite(path)?;
    store.set(&progress_key("exam-88"), "{\"stage\": 42")?;

    let machine = ExamSessionStateMachine::open(
        "exam-88",
        SubStage::DEFAULT_ORDER.to_vec(),
        store.clone(),
        5_000,
    )?;
    assert_eq!(machine.stage(), ExamStage::Identity);
    assert_eq!(machine.session().start_time_ms, 5_000);

    let raw = store.get(&progress_key("exam-88"))?.expect("rewritten");
    assert!(raw.contains("\"exam_id\":\"exam-88\""));
    Ok(())
}

#[test]
fn stages_only_move_forward() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("progress.db");
    let path = path.to_str().expect("utf-8 path");
    let store = sqlite(path)?;

    let mut machine = ExamSessionStateMachine::open(
        "exam-88",
        vec![SubStage::Coding],
        store.clone(),
        0,
    )?;
    let err = machine.submit(SubmitReason::Manual).expect_err("not verified");
    assert!(matches!(
        integrity_error(&err),
        Some(IntegrityError::InvalidTransition { .. })
    ));
    assert!(machine.complete_exam().is_err());

    machine.complete_identity()?;
    assert!(machine.complete_identity().is_err());
    assert!(machine.complete_sub_stage(SubStage::Coding, None)?);
    assert_eq!(machine.session().submit_reason, Some(SubmitReason::Completed));
    assert!(!machine.submit(SubmitReason::SecurityViolations)?);
    assert_eq!(machine.session().submit_reason, Some(SubmitReason::Completed));
    assert!(!machine.session().auto_submitted);

    machine.complete_exam()?;
    assert!(store.get(&progress_key("exam-88"))?.is_none());
    Ok(())
}

#[test]
fn reset_discards_progress() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("progress.db");
    let path = path.to_str().expect("utf-8 path");

    let mut machine = ExamSessionStateMachine::open(
        "exam-88",
        SubStage::DEFAULT_ORDER.to_vec(),
        sqlite(path)?,
        0,
    )?;
    machine.complete_identity()?;
    machine.complete_sub_stage(SubStage::Mcq, None)?;
    machine.reset(7_000)?;
    assert_eq!(machine.stage(), ExamStage::Identity);
    assert!(machine.session().stage_progress.is_empty());

    let reopened = ExamSessionStateMachine::open(
        "exam-88",
        SubStage::DEFAULT_ORDER.to_vec(),
        sqlite(path)?,
        9_000,
    )?;
    assert_eq!(reopened.stage(), ExamStage::Identity);
    assert_eq!(reopened.session().start_time_ms, 7_000);
    Ok(())
}
