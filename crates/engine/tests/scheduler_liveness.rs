//! Worker liveness on a diamond graph `A -> {B, C} -> D`: with two workers
//! A runs first, B and C overlap, and D runs strictly after both.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use engine::cell::TaskId;
use engine::config::SpaceParams;
use engine::scheduler::Scheduler;
use engine::space::Space;
use engine::task::{Task, TaskSubtype, TaskType};

const WORK: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Copy)]
struct Span {
    task: TaskId,
    start: Instant,
    end: Instant,
}

fn diamond() -> (Scheduler, [TaskId; 4]) {
    let sched = Scheduler::new(2, 0);
    let mk = |sched: &Scheduler| {
        sched.addtask(Task::new(
            TaskType::Init,
            TaskSubtype::None,
            0,
            None,
            None,
            false,
        ))
    };
    let a = mk(&sched);
    let b = mk(&sched);
    let c = mk(&sched);
    let d = mk(&sched);
    sched.addunlock(a, b);
    sched.addunlock(a, c);
    sched.addunlock(b, d);
    sched.addunlock(c, d);
    sched.set_unlocks();
    sched.rank_tasks().unwrap();
    let space = Space::new([1.0; 3], false, SpaceParams::default());
    sched.reweight(&space);
    for t in sched.tasks.read().unwrap().iter() {
        t.activate();
    }
    (sched, [a, b, c, d])
}

#[test]
fn diamond_orders_and_overlaps() {
    let (sched, [a, b, c, d]) = diamond();
    let sched = Arc::new(sched);
    let spans: Arc<Mutex<Vec<Span>>> = Arc::new(Mutex::new(Vec::new()));

    sched.start();

    let workers: Vec<_> = (0..2)
        .map(|wid| {
            let sched = Arc::clone(&sched);
            let spans = Arc::clone(&spans);
            thread::spawn(move || {
                let mut rng = sched.steal_rng(wid);
                loop {
                    match sched.gettask(wid, &mut rng) {
                        Some(tid) => {
                            let start = Instant::now();
                            thread::sleep(WORK);
                            let end = Instant::now();
                            spans.lock().unwrap().push(Span {
                                task: tid,
                                start,
                                end,
                            });
                            let tasks = sched.tasks.read().unwrap();
                            sched.task_done(&tasks, tid);
                        }
                        None => {
                            if sched.waiting() == 0 {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let spans = spans.lock().unwrap();
    assert_eq!(spans.len(), 4, "every task ran exactly once");
    let of = |tid: TaskId| *spans.iter().find(|s| s.task == tid).unwrap();
    let (sa, sb, sc, sd) = (of(a), of(b), of(c), of(d));

    // A strictly precedes both middle tasks.
    assert!(sa.end <= sb.start);
    assert!(sa.end <= sc.start);
    // B and C overlap: each starts before the other finishes.
    assert!(sb.start < sc.end && sc.start < sb.end, "B and C must overlap");
    // D runs strictly after both.
    assert!(sd.start >= sb.end);
    assert!(sd.start >= sc.end);
}
