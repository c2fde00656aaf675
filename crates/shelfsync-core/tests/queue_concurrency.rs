use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use shelfsync_core::{Database, NewTask, TaskStatus};
use tempfile::TempDir;

const WORKERS: usize = 8;
const TASKS: i64 = 200;

#[test]
fn concurrent_dequeue_never_hands_out_a_task_twice() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("queue.db");

    {
        let db = Database::open(&path).unwrap();
        for message_id in 0..TASKS {
            db.enqueue(&NewTask::new(message_id, "archive").with_priority((message_id % 3) as i32))
                .unwrap();
        }
    }

    let barrier = Arc::new(Barrier::new(WORKERS));
    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Separate handles contend the way separate worker processes would.
                let db = Database::open_with_timeout(&path, 30_000).unwrap();
                barrier.wait();
                let mut taken = Vec::new();
                while let Some(task) = db.dequeue_next().unwrap() {
                    assert_eq!(task.status, TaskStatus::Processing);
                    taken.push(task.id);
                }
                taken
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), unique.len(), "a task was dequeued twice");
    assert_eq!(all.len(), TASKS as usize);

    let db = Database::open(&path).unwrap();
    let counts = db.task_counts().unwrap();
    assert_eq!(counts, vec![(TaskStatus::Processing, TASKS as usize)]);
}

#[test]
fn shared_handle_dequeue_is_exclusive_across_threads() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    for message_id in 0..TASKS {
        db.enqueue(&NewTask::new(message_id, "archive")).unwrap();
    }

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some(task) = db.dequeue_next().unwrap() {
                    db.complete_task(task.id, true, None).unwrap();
                    taken.push(task.id);
                }
                taken
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), TASKS as usize);
    assert_eq!(all.len(), TASKS as usize);
}
