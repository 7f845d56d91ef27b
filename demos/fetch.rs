use std::time::{Duration, Instant};

use weft::{
    futures::timer::delay,
    scope::Scope,
    task::{Dispatcher, Executor},
};

async fn fetch_weather() -> (f64, &'static str) {
    delay(Duration::from_secs(1)).await; // simulated upstream latency
    (24.5, "Sunny")
}

async fn fetch_news() -> &'static str {
    delay(Duration::from_secs(1)).await;
    "Structured concurrency lands in weft"
}

async fn fetch_stock() -> (&'static str, f64) {
    delay(Duration::from_secs(1)).await;
    ("WEFT", 345.67)
}

/// Three simulated fetches running concurrently on the Io pool: total wall
/// time is one round-trip, not three.
fn main() {
    env_logger::init();

    let scope = Scope::new();
    let start = Instant::now();

    let weather = Executor::spawn(&scope, Dispatcher::Io, fetch_weather());
    let news = Executor::spawn(&scope, Dispatcher::Io, fetch_news());
    let stock = Executor::spawn(&scope, Dispatcher::Io, fetch_stock());

    Executor::block_on(async move {
        println!("Weather: {:?}", weather.await.unwrap());
        println!("News: {:?}", news.await.unwrap());
        println!("Stock: {:?}", stock.await.unwrap());
    });

    println!("Fetched all information in {:?}", start.elapsed());
}
