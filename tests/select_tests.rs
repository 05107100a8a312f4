mod common;

use common::setup_tracing_for_test;
use futures_workpool::{Queue, RecvError, Select, Selected};
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
  Left,
  Right,
}

#[tokio::test]
async fn test_fair_choice_between_perpetually_ready_queues() {
  setup_tracing_for_test();
  const ROUNDS: usize = 10_000;
  let left: Queue<u32> = Queue::new(1);
  let right: Queue<u32> = Queue::new(1);
  left.try_send(0).unwrap();
  right.try_send(0).unwrap();

  let (mut left_wins, mut right_wins) = (0usize, 0usize);
  for _ in 0..ROUNDS {
    let chosen = Select::new()
      .recv(&left, |_| Source::Left)
      .recv(&right, |_| Source::Right)
      .wait()
      .await;
    match chosen {
      Selected::Ready(Source::Left) => {
        left_wins += 1;
        left.try_send(0).unwrap();
      }
      Selected::Ready(Source::Right) => {
        right_wins += 1;
        right.try_send(0).unwrap();
      }
      other => panic!("unexpected select outcome {:?}", other),
    }
  }

  // Expected 5000 each, standard deviation 50; 4500..5500 is ten sigma wide.
  assert_eq!(left_wins + right_wins, ROUNDS);
  assert!((4_500..=5_500).contains(&left_wins), "left chosen {} times", left_wins);
  assert!((4_500..=5_500).contains(&right_wins), "right chosen {} times", right_wins);
}

#[tokio::test]
async fn test_exactly_one_branch_executes() {
  setup_tracing_for_test();
  let a: Queue<&'static str> = Queue::new(2);
  let b: Queue<&'static str> = Queue::new(2);
  a.try_send("a").unwrap();
  b.try_send("b").unwrap();

  let picked = Select::new()
    .recv(&a, |r| r.unwrap())
    .recv(&b, |r| r.unwrap())
    .wait()
    .await
    .ready()
    .unwrap();

  assert_eq!(a.len() + b.len(), 1, "only the chosen queue lost an item");
  match picked {
    "a" => assert_eq!(b.len(), 1),
    "b" => assert_eq!(a.len(), 1),
    other => panic!("unexpected item {}", other),
  }
}

#[tokio::test]
async fn test_default_branch_when_nothing_ready() {
  setup_tracing_for_test();
  let empty: Queue<u32> = Queue::new(1);
  let full: Queue<u32> = Queue::new(1);
  full.try_send(1).unwrap();

  let outcome = Select::new()
    .recv(&empty, |r| r.map(|_| "recv"))
    .send(&full, 2, |r| r.map(|_| "send").map_err(|_| RecvError))
    .try_select();
  assert_eq!(outcome, Selected::Default);
  assert_eq!(full.len(), 1);
  assert_eq!(full.try_recv(), Ok(1));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_yields_timeout_outcome() {
  setup_tracing_for_test();
  let quiet: Queue<u32> = Queue::new(4);

  let outcome = Select::new()
    .recv(&quiet, |r| r)
    .timeout(Duration::from_secs(3))
    .wait()
    .await;
  assert!(outcome.is_timed_out());
  assert!(quiet.is_empty());
}

#[tokio::test]
async fn test_ready_arm_wins_over_pending_deadline() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(1);
  let producer = {
    let queue = queue.clone();
    tokio::spawn(async move {
      sleep(Duration::from_millis(20)).await;
      queue.send(42).await.unwrap();
    })
  };

  let outcome = Select::new()
    .recv(&queue, |r| r)
    .timeout(Duration::from_secs(5))
    .wait()
    .await;
  assert_eq!(outcome, Selected::Ready(Ok(42)));
  producer.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_queue_is_ready() {
  setup_tracing_for_test();
  let closed: Queue<u32> = Queue::new(1);
  closed.close();
  let idle: Queue<u32> = Queue::new(1);

  let outcome = Select::new().recv(&idle, |r| r).recv(&closed, |r| r).wait().await;
  assert_eq!(outcome, Selected::Ready(Err(RecvError)));
}

#[tokio::test]
async fn test_send_arm_waits_for_room() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(1);
  queue.try_send(1).unwrap();

  let consumer = {
    let queue = queue.clone();
    tokio::spawn(async move {
      sleep(Duration::from_millis(20)).await;
      queue.recv().await
    })
  };

  let outcome = timeout(
    Duration::from_secs(1),
    Select::new().send(&queue, 2, |r| r.is_ok()).wait(),
  )
  .await
  .expect("send arm never became ready");
  assert_eq!(outcome, Selected::Ready(true));
  assert_eq!(consumer.await.unwrap(), Ok(1));
  assert_eq!(queue.try_recv(), Ok(2));
}

#[tokio::test]
async fn test_send_arm_on_closed_queue_returns_item() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(1);
  queue.close();

  let outcome = Select::new()
    .send(&queue, 5, |r| r.map_err(|e| e.into_inner()))
    .try_select();
  assert_eq!(outcome, Selected::Ready(Err(5)));
}

#[tokio::test]
async fn test_select_recv_meets_blocked_rendezvous_sender() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(0);
  let sender = {
    let queue = queue.clone();
    tokio::spawn(async move { queue.send(7).await })
  };
  sleep(Duration::from_millis(10)).await;

  let outcome = Select::new().recv(&queue, |r| r).wait().await;
  assert_eq!(outcome, Selected::Ready(Ok(7)));
  sender.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_two_selects_rendezvous_on_zero_capacity_queue() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(0);
  let receiving = {
    let queue = queue.clone();
    tokio::spawn(async move { Select::new().recv(&queue, |r| r).wait().await })
  };
  sleep(Duration::from_millis(10)).await;

  let sent = timeout(
    Duration::from_secs(1),
    Select::new().send(&queue, 11, |r| r.is_ok()).wait(),
  )
  .await
  .expect("send select never met the receiving select");
  assert_eq!(sent, Selected::Ready(true));
  assert_eq!(receiving.await.unwrap(), Selected::Ready(Ok(11)));
}
