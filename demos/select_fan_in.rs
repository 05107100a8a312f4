use futures_workpool::{Queue, Select, Selected};
use std::time::Duration;
use tracing::info;

#[derive(Debug)]
enum Event {
  Fast(u32),
  Slow(u32),
  Closed(&'static str),
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Select Fan-In Example ---");

  let fast: Queue<u32> = Queue::named("fast", 0);
  let slow: Queue<u32> = Queue::named("slow", 0);

  for (queue, period_ms, count) in [(fast.clone(), 100u64, 6u32), (slow.clone(), 250, 3)] {
    tokio::spawn(async move {
      for i in 0..count {
        tokio::time::sleep(Duration::from_millis(period_ms)).await;
        if queue.send(i).await.is_err() {
          break;
        }
      }
      queue.close();
    });
  }

  let mut open = 2;
  while open > 0 {
    let outcome = Select::new()
      .recv(&fast, |r| r.map(Event::Fast).unwrap_or(Event::Closed("fast")))
      .recv(&slow, |r| r.map(Event::Slow).unwrap_or(Event::Closed("slow")))
      .timeout(Duration::from_millis(200))
      .wait()
      .await;
    match outcome {
      Selected::Ready(Event::Closed(name)) => {
        info!("Queue '{}' is exhausted.", name);
        open -= 1;
        // An exhausted queue stays ready forever; give the other one a turn.
        if open == 1 {
          let remaining = if name == "fast" { &slow } else { &fast };
          while let Ok(value) = remaining.recv().await {
            info!("Received {} from the remaining queue", value);
          }
          open = 0;
        }
      }
      Selected::Ready(event) => info!(?event, "Received"),
      Selected::TimedOut => info!("Nothing arrived within 200ms"),
      Selected::Default => unreachable!("wait() never takes the default branch"),
    }
  }

  info!("--- Select Fan-In Example End ---");
}
