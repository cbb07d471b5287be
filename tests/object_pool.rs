use std::collections::HashSet;
use std::env;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use tasktimer::{LockFreePool, ObjectPool, PoolError};

#[derive(Default)]
struct Connection {
    opened: u32,
}

#[test]
fn test_pool_reuses_recycled_instances() {
    let pool: ObjectPool<Connection> = ObjectPool::new("connections");

    let first = pool.create_with(|| Connection { opened: 7 });
    let addr = Arc::as_ptr(&first);
    pool.recycle(first);
    assert_eq!(pool.idle(), 1);

    let again = pool.create();
    assert_eq!(Arc::as_ptr(&again), addr, "Pool should hand back the idle instance");
    assert_eq!(again.opened, 7, "Reused instances are not reset by the pool");
    assert_eq!(pool.constructed(), 1);
    assert_eq!(pool.live(), 1);

    let fresh = pool.create();
    assert_ne!(Arc::as_ptr(&fresh), addr);
    assert_eq!(pool.constructed(), 2);
    assert_eq!(pool.live(), 2);
}

#[test]
fn test_pool_rejects_foreign_objects() {
    let pool: ObjectPool<Connection> = ObjectPool::new("connections");
    let stranger = Arc::new(Connection::default());
    let addr = Arc::as_ptr(&stranger) as usize;

    assert_eq!(pool.try_recycle(stranger), Err(PoolError::Foreign(addr)));
    assert_eq!(pool.idle(), 0);
}

#[test]
fn test_pool_rejects_double_recycle() {
    let pool: ObjectPool<Connection> = ObjectPool::new("connections");
    let conn = pool.create();
    let alias = conn.clone();
    let addr = Arc::as_ptr(&conn) as usize;

    assert_eq!(pool.try_recycle(conn), Ok(()));
    assert_eq!(pool.try_recycle(alias), Err(PoolError::AlreadyIdle(addr)));
    assert_eq!(pool.idle(), 1, "Double recycle must not queue the object twice");
}

#[test]
fn test_pool_for_each_live_sees_idle_and_busy() {
    let pool: ObjectPool<Connection> = ObjectPool::new("connections");
    let busy = pool.create();
    let idle = pool.create();
    pool.recycle(idle);

    let mut seen = 0;
    pool.for_each_live(|_| seen += 1);
    assert_eq!(seen, 2);
    drop(busy);
}

#[test]
fn test_pool_concurrent_create_and_recycle() {
    let pool: Arc<ObjectPool<Connection>> = Arc::new(ObjectPool::new("connections"));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    let conn = pool.create();
                    pool.recycle(conn);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.constructed() < 8 * 1_000, "Recycled instances should be reused");
    assert_eq!(pool.constructed(), pool.live());
    assert_eq!(pool.idle(), pool.live());

    let mut addrs = HashSet::new();
    let drained: Vec<_> = (0..pool.live()).map(|_| pool.create()).collect();
    for conn in &drained {
        assert!(addrs.insert(Arc::as_ptr(conn)), "An instance was handed out twice");
    }
}

#[test]
fn test_lock_free_pool_reuse() {
    let pool: LockFreePool<Vec<u8>> = LockFreePool::new();
    let mut buffer = pool.create();
    buffer.extend_from_slice(b"abc");
    pool.recycle(buffer);

    let buffer = pool.create();
    assert_eq!(&buffer[..], b"abc");
    assert_eq!(pool.idle(), 0);
}

// Set in the child process spawned by the abort tests; names the misuse to commit.
const MISUSE_VAR: &str = "TASKTIMER_POOL_MISUSE";

fn commit_misuse(kind: &str) {
    let pool: ObjectPool<Connection> = ObjectPool::new("connections");
    match kind {
        "foreign" => pool.recycle(Arc::new(Connection::default())),
        "double" => {
            let conn = pool.create();
            let alias = conn.clone();
            pool.recycle(conn);
            pool.recycle(alias);
        }
        other => panic!("unknown misuse {other}"),
    }
}

fn assert_misuse_aborts(test_name: &str, kind: &str) {
    if let Ok(requested) = env::var(MISUSE_VAR) {
        commit_misuse(&requested);
        // Reaching this point means recycle() returned; exit cleanly so the parent fails.
        std::process::exit(0);
    }

    let status = Command::new(env::current_exe().unwrap())
        .args([test_name, "--exact", "--test-threads=1"])
        .env(MISUSE_VAR, kind)
        .status()
        .unwrap();

    assert!(!status.success(), "recycle() of a {kind} object should abort the process");

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(libc::SIGABRT), "Expected SIGABRT, got {status:?}");
    }
}

#[test]
fn test_pool_recycle_foreign_object_aborts() {
    assert_misuse_aborts("test_pool_recycle_foreign_object_aborts", "foreign");
}

#[test]
fn test_pool_recycle_twice_aborts() {
    assert_misuse_aborts("test_pool_recycle_twice_aborts", "double");
}
