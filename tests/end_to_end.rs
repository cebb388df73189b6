//! End-to-end scenarios across the public surface.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gonex::{
    channel, context, once, recv_case, rw_mutex, select_with_default, spawn, wait_group,
    ErrorKind, GonexError, GonexResult, SharedQueue, TaskOptions, Timeout,
};

#[tokio::test]
async fn fan_out_fan_in() {
    let input = channel::<i64>(0).expect("input channel");
    let output = channel::<i64>(10).expect("output channel");
    let wg = wait_group();

    wg.add(3).expect("add");
    for _ in 0..3 {
        let input = input.clone();
        let output = output.clone();
        let wg = wg.clone();
        spawn(
            async move {
                while let Some(x) = input.receive_timeout(Timeout::INFINITE).await? {
                    output.send_timeout(x * 2, Timeout::INFINITE).await?;
                }
                wg.done()
            },
            TaskOptions::default(),
        );
    }

    let collector = {
        let output = output.clone();
        spawn(
            async move {
                let mut got = Vec::new();
                for _ in 0..15 {
                    match output.receive_timeout(Timeout::INFINITE).await? {
                        Some(v) => got.push(v),
                        None => break,
                    }
                }
                Ok(got)
            },
            TaskOptions::default(),
        )
    };

    for x in 1..=15i64 {
        input.send_timeout(x, Timeout::INFINITE).await.expect("send");
    }
    input.close();

    // Workers observe the close and exit.
    wg.wait().await.expect("workers exit cleanly");

    let got = collector.join().await.expect("collect");
    let got_set: BTreeSet<i64> = got.iter().copied().collect();
    let expected: BTreeSet<i64> = (1..=15).map(|x| x * 2).collect();
    assert_eq!(got.len(), 15);
    assert_eq!(got_set, expected);

    // No orphaned waiters: the drained output is empty and the closed input
    // rejects further sends.
    assert_eq!(output.len(), 0);
    assert!(input.try_send(99).is_err());
}

#[tokio::test]
async fn timeout_cancellation() {
    let (ctx, _canceler) = context::with_timeout(&context::background(), 300).expect("ctx");
    let started = Instant::now();
    let task = {
        let ctx = ctx.clone();
        spawn(
            async move {
                for _ in 0..10 {
                    gonex::sleep(50).await;
                    if ctx.err().is_some() {
                        return Ok(());
                    }
                }
                Ok(())
            },
            TaskOptions::default(),
        )
    };
    task.join().await.expect("task returns");

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(290) && elapsed < Duration::from_millis(450),
        "task should observe the ~300ms cancellation, took {elapsed:?}"
    );
    assert_eq!(ctx.err().map(|e| e.kind()), Some(ErrorKind::ContextTimeout));
}

#[tokio::test]
async fn rwmutex_writer_preference() {
    let rw = rw_mutex();
    rw.r_lock().await.expect("first read lock");
    rw.r_lock().await.expect("second read lock");

    let writer = {
        let rw = rw.clone();
        spawn(
            async move { rw.lock_timeout(Timeout::INFINITE).await },
            TaskOptions::default(),
        )
    };
    gonex::sleep(30).await;

    // With a writer waiting, a third read attempt is refused.
    assert!(!rw.try_r_lock().expect("try_r_lock"));

    rw.r_unlock().expect("release first");
    rw.r_unlock().expect("release second");

    writer.join().await.expect("writer acquires");
    assert!(rw.is_write_locked());
    rw.unlock().expect("writer releases");
}

#[tokio::test]
async fn once_error_retry() {
    let error_once = once();

    let mut attempts = Vec::new();
    for _ in 0..3 {
        let error_once = error_once.clone();
        attempts.push(spawn(
            async move {
                error_once
                    .call(|| async {
                        gonex::sleep(20).await;
                        Err(GonexError::Internal {
                            message: "init failed".to_string(),
                        })
                    })
                    .await
            },
            TaskOptions::default(),
        ));
    }
    let mut failures = 0;
    for attempt in attempts {
        if attempt.join().await.is_err() {
            failures += 1;
        }
    }
    // All three callers observe the same failure.
    assert_eq!(failures, 3);
    assert!(!error_once.is_done());

    // A later call re-attempts and succeeds.
    error_once
        .call(|| async { Ok(()) })
        .await
        .expect("retry succeeds");
    assert!(error_once.is_done());

    // Further calls are no-ops.
    let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let r = ran.clone();
    error_once
        .call(|| async move {
            r.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .expect("no-op call");
    assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn select_with_default_runs_immediately() {
    let a = channel::<i32>(0).expect("a");
    let b = channel::<i32>(0).expect("b");
    let marked = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let m = marked.clone();

    let started = Instant::now();
    let result: Option<i32> = select_with_default(
        vec![recv_case(&a, |v| v.unwrap_or(0)), recv_case(&b, |v| v.unwrap_or(0))],
        move || m.store(true, std::sync::atomic::Ordering::SeqCst),
    )
    .await
    .expect("select");

    assert_eq!(result, None);
    assert!(marked.load(std::sync::atomic::Ordering::SeqCst));
    assert!(started.elapsed() < Duration::from_millis(50), "no blocking");
}

#[tokio::test]
async fn shared_queue_mpmc() {
    let q = Arc::new(SharedQueue::new(50, 32).expect("queue"));

    let mut producers = Vec::new();
    for p in 0u32..3 {
        let q = q.clone();
        producers.push(std::thread::spawn(move || -> GonexResult<()> {
            for i in 0u32..20 {
                q.enqueue(&(p, i), Some(Duration::from_secs(10)))?;
            }
            Ok(())
        }));
    }

    let consumer = {
        let q = q.clone();
        std::thread::spawn(move || -> GonexResult<Vec<(u32, u32)>> {
            let mut got = Vec::with_capacity(60);
            for _ in 0..60 {
                got.push(q.dequeue(Some(Duration::from_secs(10)))?);
            }
            Ok(got)
        })
    };

    for p in producers {
        p.join().expect("producer thread").expect("producer ok");
    }
    let got = consumer.join().expect("consumer thread").expect("consumer ok");

    // All 60 integers observed.
    assert_eq!(got.len(), 60);
    let mut all: Vec<(u32, u32)> = got.clone();
    all.sort_unstable();
    let expected: Vec<(u32, u32)> =
        (0..3).flat_map(|p| (0..20).map(move |i| (p, i))).collect();
    assert_eq!(all, expected);

    // Per-producer order preserved.
    for p in 0..3 {
        let seq: Vec<u32> = got.iter().filter(|(pp, _)| *pp == p).map(|(_, i)| *i).collect();
        assert_eq!(seq, (0..20).collect::<Vec<_>>());
    }

    assert_eq!(q.len(), 0);
}
