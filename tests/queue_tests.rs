mod common;

use common::setup_tracing_for_test;
use futures_workpool::{Queue, RecvError, SendError, TryRecvError, TrySendError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_rendezvous_completes_only_when_both_sides_ready() {
  setup_tracing_for_test();
  let queue: Queue<&'static str> = Queue::named("rendezvous", 0);
  let delivered = Arc::new(AtomicBool::new(false));

  let sender = {
    let queue = queue.clone();
    let delivered = delivered.clone();
    tokio::spawn(async move {
      queue.send("x").await.unwrap();
      delivered.store(true, Ordering::SeqCst);
    })
  };

  sleep(Duration::from_millis(50)).await;
  assert!(!delivered.load(Ordering::SeqCst), "send returned before any receiver was ready");
  assert_eq!(queue.len(), 0, "a rendezvous queue buffers nothing");

  assert_eq!(queue.recv().await, Ok("x"));
  sender.await.unwrap();
  assert!(delivered.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_receiver_waiting_first_on_rendezvous() {
  setup_tracing_for_test();
  let queue: Queue<u8> = Queue::new(0);
  let receiver = {
    let queue = queue.clone();
    tokio::spawn(async move { queue.recv().await })
  };
  sleep(Duration::from_millis(20)).await;

  timeout(Duration::from_millis(100), queue.send(9))
    .await
    .expect("send should meet the waiting receiver")
    .unwrap();
  assert_eq!(receiver.await.unwrap(), Ok(9));
}

#[tokio::test]
async fn test_capacity_plus_one_send_blocks() {
  setup_tracing_for_test();
  const CAPACITY: usize = 3;
  let queue: Queue<usize> = Queue::new(CAPACITY);
  for i in 0..CAPACITY {
    queue.try_send(i).unwrap();
  }
  assert_eq!(queue.len(), CAPACITY);
  assert!(matches!(queue.try_send(99), Err(TrySendError::Full(99))));

  let blocked = timeout(Duration::from_millis(30), queue.send(CAPACITY)).await;
  assert!(blocked.is_err(), "the (C+1)-th send must block");
  assert_eq!(queue.len(), CAPACITY);

  let sender = {
    let queue = queue.clone();
    tokio::spawn(async move { queue.send(CAPACITY).await })
  };
  sleep(Duration::from_millis(10)).await;
  assert_eq!(queue.recv().await, Ok(0));
  sender.await.unwrap().unwrap();
  assert_eq!(queue.len(), CAPACITY);

  let drained: Vec<usize> = std::iter::from_fn(|| queue.try_recv().ok()).collect();
  assert_eq!(drained, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_never_exceed_capacity() {
  setup_tracing_for_test();
  const CAPACITY: usize = 4;
  const PRODUCERS: u32 = 6;
  const PER_PRODUCER: u32 = 200;
  let queue: Queue<(u32, u32)> = Queue::new(CAPACITY);

  let producers: Vec<_> = (0..PRODUCERS)
    .map(|p| {
      let queue = queue.clone();
      tokio::spawn(async move {
        for seq in 0..PER_PRODUCER {
          queue.send((p, seq)).await.unwrap();
        }
      })
    })
    .collect();

  let mut last_seen: HashMap<u32, u32> = HashMap::new();
  for _ in 0..PRODUCERS * PER_PRODUCER {
    assert!(queue.len() <= CAPACITY);
    let (p, seq) = queue.recv().await.unwrap();
    // FIFO per producer survives concurrent interleaving.
    if let Some(prev) = last_seen.insert(p, seq) {
      assert!(seq > prev, "producer {} delivered {} after {}", p, seq, prev);
    }
  }
  for producer in producers {
    producer.await.unwrap();
  }
  assert_eq!(queue.total_sent(), (PRODUCERS * PER_PRODUCER) as u64);
  assert_eq!(queue.total_received(), (PRODUCERS * PER_PRODUCER) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_item_reaches_exactly_one_consumer() {
  setup_tracing_for_test();
  const ITEMS: u32 = 2_000;
  let queue: Queue<u32> = Queue::new(8);

  let consumers: Vec<_> = (0..4)
    .map(|_| {
      let queue = queue.clone();
      tokio::spawn(async move {
        let mut got = Vec::new();
        while let Ok(item) = queue.recv().await {
          got.push(item);
        }
        got
      })
    })
    .collect();

  for i in 0..ITEMS {
    queue.send(i).await.unwrap();
  }
  queue.close();

  let mut all = Vec::new();
  for consumer in consumers {
    all.extend(consumer.await.unwrap());
  }
  assert_eq!(all.len() as u32, ITEMS);
  assert_eq!(all.into_iter().collect::<HashSet<_>>().len() as u32, ITEMS);
}

#[tokio::test]
async fn test_closed_queue_drains_then_reports_exhausted() {
  setup_tracing_for_test();
  let queue: Queue<String> = Queue::new(4);
  queue.send("a".to_string()).await.unwrap();
  queue.send("b".to_string()).await.unwrap();

  assert!(queue.close());
  assert!(!queue.close());
  assert!(queue.is_closed());

  // Sending after close fails immediately and hands the item back.
  let rejected = timeout(Duration::from_millis(10), queue.send("c".to_string()))
    .await
    .expect("send on a closed queue must not block");
  assert_eq!(rejected.map_err(SendError::into_inner), Err("c".to_string()));
  assert!(matches!(queue.try_send("d".to_string()), Err(TrySendError::Closed(_))));

  assert_eq!(queue.recv().await.as_deref(), Ok("a"));
  assert_eq!(queue.try_recv().as_deref(), Ok("b"));
  assert_eq!(queue.try_recv(), Err(TryRecvError::Exhausted));
  assert_eq!(queue.recv().await, Err(RecvError));
}

#[tokio::test]
async fn test_close_wakes_blocked_receivers() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(2);
  let receivers: Vec<_> = (0..3)
    .map(|_| {
      let queue = queue.clone();
      tokio::spawn(async move { queue.recv().await })
    })
    .collect();
  sleep(Duration::from_millis(20)).await;

  queue.close();
  for receiver in receivers {
    let outcome = timeout(Duration::from_millis(100), receiver).await.unwrap().unwrap();
    assert_eq!(outcome, Err(RecvError));
  }
}

#[tokio::test]
async fn test_rendezvous_without_receiver_would_deadlock() {
  setup_tracing_for_test();
  // A capacity-0 send with nobody receiving never completes; guard with a timeout.
  let queue: Queue<u32> = Queue::new(0);
  assert!(timeout(Duration::from_millis(50), queue.send(1)).await.is_err());
  assert_eq!(queue.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_rendezvous_hand_off_outlives_cancelled_receiver() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(0);
  let receiver = {
    let queue = queue.clone();
    tokio::spawn(async move { queue.recv().await })
  };

  let mut handed_off = false;
  for _ in 0..100 {
    if queue.try_send(1).is_ok() {
      handed_off = true;
      break;
    }
    sleep(Duration::from_millis(2)).await;
  }
  assert!(handed_off, "receiver never started waiting");

  // Cancel the receiver before it gets polled again.
  receiver.abort();
  assert!(receiver.await.unwrap_err().is_cancelled());

  assert_eq!(queue.len(), 1);
  assert!(!queue.is_empty());
  assert!(queue.try_send(2).unwrap_err().is_full());

  let next = timeout(Duration::from_millis(100), queue.recv())
    .await
    .expect("the next receiver should get the pending hand-off");
  assert_eq!(next, Ok(1));
  assert!(queue.is_empty());
  assert_eq!(queue.total_received(), 1);
}

#[tokio::test]
async fn test_rendezvous_hand_off_moves_to_remaining_receiver() {
  setup_tracing_for_test();
  let queue: Queue<u32> = Queue::new(0);
  let spawn_receiver = || {
    let queue = queue.clone();
    tokio::spawn(async move { queue.recv().await })
  };
  let doomed = spawn_receiver();
  sleep(Duration::from_millis(10)).await;
  let survivor = spawn_receiver();
  sleep(Duration::from_millis(10)).await;

  queue.try_send(5).unwrap();
  assert!(queue.try_send(6).is_ok(), "a second receiver is still unclaimed");
  doomed.abort();
  assert!(doomed.await.unwrap_err().is_cancelled());

  let first = timeout(Duration::from_millis(100), survivor)
    .await
    .expect("remaining receiver never woke")
    .unwrap();
  assert_eq!(first, Ok(5));
  assert_eq!(queue.len(), 1);
  assert_eq!(queue.try_recv(), Ok(6));
}
