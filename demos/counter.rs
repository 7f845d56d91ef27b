use std::sync::Arc;

use clap::Parser;
use weft::{
    futures::mutex::Mutex,
    scope::Scope,
    task::{Dispatcher, Executor},
};

/// Increment a mutex-guarded counter from many concurrent tasks and check
/// that no update is lost.
#[derive(Parser, Debug)]
struct Args {
    /// Number of concurrent tasks.
    #[arg(short, long, default_value_t = 100)]
    tasks: usize,

    /// Increments performed by each task.
    #[arg(short, long, default_value_t = 1000)]
    increments: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let scope = Scope::new();
    let counter = Arc::new(Mutex::new(0usize));

    let handles: Vec<_> = (0..args.tasks)
        .map(|_| {
            let counter = counter.clone();
            let increments = args.increments;
            Executor::spawn(&scope, Dispatcher::Default, async move {
                for _ in 0..increments {
                    counter.with_lock(|c| *c += 1).await;
                }
            })
        })
        .collect();

    let expected = args.tasks * args.increments;
    let actual = Executor::block_on(async move {
        for handle in handles {
            handle.await.unwrap();
        }
        *counter.lock().await
    });

    println!("Expected final count: {expected}");
    println!("Actual final count:   {actual}");
    assert_eq!(expected, actual);
    println!("The counter was incremented safely and consistently!");
}
