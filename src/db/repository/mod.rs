//! Repository layer: entity-scoped database operations.

mod push;
mod task;

pub use push::*;
pub use task::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::db::DatabaseError;
    use crate::models::*;
    use chrono::Utc;
    use rusqlite::Connection;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn test_db() -> Connection {
        open_memory_database().unwrap()
    }

    fn make_task(fingerprint: &str) -> Task {
        Task::queued(
            FileRef {
                content_hash: "abc".into(),
                storage_ref: "blob/abc".into(),
                file_name: "invoice.txt".into(),
                size_bytes: 3,
            },
            fingerprint.into(),
            "invoice",
            1,
        )
    }

    fn move_to(task: &mut Task, state: TaskState) {
        task.transitions.push(Transition {
            from: Some(task.state),
            to: state,
            at: Utc::now(),
            note: None,
        });
        task.state = state;
        task.updated_at = Utc::now();
    }

    fn attempt(task_id: Uuid, target: &str, n: u32, success: bool) -> PushAttempt {
        PushAttempt {
            id: Uuid::new_v4(),
            task_id,
            target_id: target.into(),
            attempt: n,
            success,
            status_code: Some(if success { 200 } else { 500 }),
            error: (!success).then(|| "HTTP 500".to_string()),
            duration_ms: 12,
            request: RequestCapture {
                method: "POST".into(),
                url: "http://localhost/hook".into(),
                headers: BTreeMap::new(),
                body: "{}".into(),
            },
            response: Some(ResponseCapture {
                status: if success { 200 } else { 500 },
                headers: BTreeMap::new(),
                body: String::new(),
            }),
            retry_delay_secs: (!success).then_some(10),
            attempted_at: Utc::now(),
        }
    }

    #[test]
    fn insert_and_get_task_roundtrip() {
        let conn = test_db();
        let mut task = make_task("fp-1");
        task.fields.insert(
            "number".into(),
            FieldResult {
                value: json!("INV-1"),
                confidence: 91.0,
                source_page: Some(1),
                strategy: StrategyKind::Regex,
                row_pages: vec![],
                raw_value: None,
            },
        );
        insert_task(&conn, &task).unwrap();

        let loaded = get_task(&conn, &task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.fields["number"].value, json!("INV-1"));
        assert!(get_task(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn update_appends_transitions_only_once() {
        let conn = test_db();
        let mut task = make_task("fp-1");
        insert_task(&conn, &task).unwrap();

        move_to(&mut task, TaskState::Processing);
        update_task(&conn, &task).unwrap();
        move_to(&mut task, TaskState::Completed);
        update_task(&conn, &task).unwrap();
        update_task(&conn, &task).unwrap();

        let transitions = get_transitions(&conn, &task.id).unwrap();
        let states: Vec<TaskState> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![TaskState::Queued, TaskState::Processing, TaskState::Completed]
        );
        assert_eq!(transitions[1].from, Some(TaskState::Queued));
    }

    #[test]
    fn update_missing_task_is_not_found() {
        let conn = test_db();
        let task = make_task("fp-1");
        let err = update_task(&conn, &task).unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[test]
    fn reusable_task_requires_final_result() {
        let conn = test_db();
        let mut in_flight = make_task("fp-1");
        move_to(&mut in_flight, TaskState::Processing);
        insert_task(&conn, &in_flight).unwrap();
        assert!(find_reusable_task(&conn, "fp-1").unwrap().is_none());

        let mut failed = make_task("fp-1");
        move_to(&mut failed, TaskState::Processing);
        move_to(&mut failed, TaskState::Failed);
        insert_task(&conn, &failed).unwrap();
        assert!(find_reusable_task(&conn, "fp-1").unwrap().is_none());

        let mut done = make_task("fp-1");
        move_to(&mut done, TaskState::Processing);
        move_to(&mut done, TaskState::Completed);
        move_to(&mut done, TaskState::Pushing);
        move_to(&mut done, TaskState::PushFailed);
        insert_task(&conn, &done).unwrap();
        let hit = find_reusable_task(&conn, "fp-1").unwrap().unwrap();
        assert_eq!(hit.id, done.id);

        assert!(find_reusable_task(&conn, "fp-other").unwrap().is_none());
    }

    #[test]
    fn list_by_state_filters() {
        let conn = test_db();
        let a = make_task("a");
        let mut b = make_task("b");
        move_to(&mut b, TaskState::Processing);
        insert_task(&conn, &a).unwrap();
        insert_task(&conn, &b).unwrap();

        let queued = list_tasks_by_state(&conn, TaskState::Queued).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);
    }

    #[test]
    fn push_attempts_are_append_only() {
        let conn = test_db();
        let task = make_task("fp");
        insert_task(&conn, &task).unwrap();

        insert_push_attempt(&conn, &attempt(task.id, "erp", 1, false)).unwrap();
        insert_push_attempt(&conn, &attempt(task.id, "erp", 2, true)).unwrap();
        insert_push_attempt(&conn, &attempt(task.id, "crm", 1, true)).unwrap();

        let all = list_push_attempts(&conn, &task.id).unwrap();
        assert_eq!(all.len(), 3);
        let erp = list_target_attempts(&conn, &task.id, "erp").unwrap();
        assert_eq!(erp.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(erp[0].retry_delay_secs, Some(10));
        assert_eq!(erp[1].response.as_ref().unwrap().status, 200);
        assert_eq!(next_attempt_number(&conn, &task.id, "erp").unwrap(), 3);
        assert_eq!(next_attempt_number(&conn, &task.id, "none").unwrap(), 1);

        let update = conn.execute("UPDATE push_attempts SET success = 1", []);
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM push_attempts", []);
        assert!(delete.is_err());
    }

    #[test]
    fn dead_letter_upsert_and_delete() {
        let conn = test_db();
        let task = make_task("fp");
        insert_task(&conn, &task).unwrap();

        let letter = DeadLetter {
            id: Uuid::new_v4(),
            task_id: task.id,
            target_id: "erp".into(),
            attempts: 3,
            last_error: "HTTP 500".into(),
            created_at: Utc::now(),
        };
        upsert_dead_letter(&conn, &letter).unwrap();
        upsert_dead_letter(
            &conn,
            &DeadLetter {
                id: Uuid::new_v4(),
                attempts: 4,
                last_error: "HTTP 502".into(),
                ..letter.clone()
            },
        )
        .unwrap();

        let all = list_dead_letters(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, letter.id);
        assert_eq!(all[0].attempts, 4);
        assert_eq!(all[0].last_error, "HTTP 502");
        assert_eq!(count_dead_letters_for_task(&conn, &task.id).unwrap(), 1);

        delete_dead_letter(&conn, &letter.id).unwrap();
        assert!(get_dead_letter(&conn, &letter.id).unwrap().is_none());
        assert!(delete_dead_letter(&conn, &letter.id).is_err());
    }
}
