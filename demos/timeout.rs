use std::time::Duration;

use weft::{
    futures::{
        timeout::{with_timeout, with_timeout_or_none},
        timer::delay,
    },
    scope::Scope,
    task::{self, Dispatcher, Executor},
};

/// Cooperative cancellation and deadline guards: a job that checks its own
/// cancellation flag, `cancel_and_join`, then `with_timeout` in both the
/// error-raising and the `None`-converting flavour.
fn main() {
    env_logger::init();

    let scope = Scope::new();

    let job = Executor::spawn(&scope, Dispatcher::Default, async {
        println!("job: Started");
        for i in 0.. {
            if !task::is_active() {
                break;
            }
            println!("job: Working... Step {i}");
            delay(Duration::from_millis(100)).await;
        }
        println!("job: Winding down");
    });

    Executor::block_on(async move {
        delay(Duration::from_millis(500)).await;
        println!("Main: Cancelling job...");
        let _ = job.cancel_and_join().await;
        println!("Main: job is cancelled.\n");

        let timed_out = with_timeout(Duration::from_millis(300), async {
            for i in 0..100 {
                println!("Timeout job: Working... Step {i}");
                delay(Duration::from_millis(100)).await;
            }
        })
        .await;
        println!("Timeout job result: {timed_out:?}\n");

        let result = with_timeout_or_none(Duration::from_millis(300), async {
            for i in 0..10 {
                println!("Graceful timeout job: Working... Step {i}");
                delay(Duration::from_millis(100)).await;
            }
            "Graceful timeout job: Completed"
        })
        .await;
        println!("Result: {result:?} (None means the deadline fired)");
    });
}
