use std::time::Duration;

use weft::{
    futures::{
        channel::{produce, Capacity, Channel},
        timer::delay,
    },
    scope::Scope,
    task::{Dispatcher, Executor},
};

/// One producer fanned out to five processors, then a buffered channel
/// drained after close. Each element goes to exactly one processor.
fn main() {
    env_logger::init();

    let scope = Scope::new();

    let (numbers, producer) = produce(
        &scope,
        Dispatcher::Default,
        Capacity::Rendezvous,
        |chan| async move {
            let mut x = 1u32;
            loop {
                chan.send(x).await.unwrap();
                x += 1;
                delay(Duration::from_millis(100)).await;
            }
        },
    );

    let processors: Vec<_> = (0..5)
        .map(|id| {
            let numbers = numbers.clone();
            Executor::spawn(&scope, Dispatcher::Default, async move {
                while let Some(msg) = numbers.next().await {
                    println!("Processor #{id} received {msg}");
                }
            })
        })
        .collect();

    Executor::block_on(async move {
        delay(Duration::from_millis(950)).await;
        producer.cancel_and_join().await.unwrap_err();
        for processor in processors {
            processor.await.unwrap();
        }

        let buffered = Channel::new(Capacity::Bounded(100));
        for x in 1..=5 {
            buffered.send(x).await.unwrap();
            println!("Sent {x}");
        }
        buffered.close().unwrap();

        while let Some(y) = buffered.next().await {
            println!("Received {y}");
        }
    });
}
