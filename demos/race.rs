use std::time::Duration;

use weft::{
    futures::{
        channel::{produce, Capacity},
        select::Select,
        timer::delay,
    },
    scope::Scope,
    task::{Dispatcher, Executor},
};

/// Two producers raced with select until both channels close. Whichever
/// side has an element ready wins that round; neither side is starved.
fn main() {
    env_logger::init();

    let scope = Scope::new();

    let (channel_a, _) = produce(
        &scope,
        Dispatcher::Default,
        Capacity::Rendezvous,
        |chan| async move {
            for i in 1..=10i32 {
                delay(Duration::from_millis(150)).await;
                chan.send(i).await.unwrap();
            }
        },
    );
    let (channel_b, _) = produce(
        &scope,
        Dispatcher::Default,
        Capacity::Rendezvous,
        |chan| async move {
            for i in 1..=10i32 {
                delay(Duration::from_millis(100)).await;
                chan.send(-i).await.unwrap();
            }
        },
    );

    Executor::block_on(async move {
        let mut open_a = true;
        let mut open_b = true;

        // A closed channel's clause is always ready, so drop a channel out
        // of the race as soon as it reports closed.
        while open_a && open_b {
            let (label, received) = Select::new()
                .recv(&channel_a, |r| ("Channel A", r))
                .recv(&channel_b, |r| ("Channel B", r))
                .await;

            match received {
                Ok(value) => println!("{label}: {value}"),
                Err(_) => match label {
                    "Channel A" => open_a = false,
                    _ => open_b = false,
                },
            }
        }

        while let Some(value) = channel_a.next().await {
            println!("Channel A: {value}");
        }
        while let Some(value) = channel_b.next().await {
            println!("Channel B: {value}");
        }
    });
}
