use criterion::{black_box, criterion_group, criterion_main, Criterion};
use support_broker::queue::{Priority, PriorityQueue, QueuedMessage};
use tokio::runtime::Runtime;
use uuid::Uuid;

fn make_message(priority: Priority) -> QueuedMessage {
    QueuedMessage {
        message_id: Uuid::new_v4().to_string(),
        update_id: 1,
        chat_id: 1,
        user_id: Some(1),
        chat_type: "private".to_string(),
        priority,
        payload: serde_json::Value::Null,
        created_at_ms: 0,
        retry_count: 0,
        assigned_bot_id: None,
    }
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let queue = rt.block_on(PriorityQueue::new(None, "bench:queue"));

    c.bench_function("enqueue_normal_priority", |b| {
        b.to_async(&rt).iter(|| async {
            queue.enqueue(black_box(make_message(Priority::Normal))).await.unwrap();
        })
    });

    c.bench_function("dequeue_from_populated_queue", |b| {
        b.to_async(&rt).iter(|| async {
            queue.enqueue(make_message(Priority::Normal)).await.unwrap();
            let msg = queue.dequeue(black_box("bench-worker")).await.unwrap();
            black_box(msg);
        })
    });
}

fn bench_mixed_priority_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("mixed_priority_enqueue_then_drain", |b| {
        b.to_async(&rt).iter(|| async {
            let queue = PriorityQueue::new(None, "bench:mixed").await;
            for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent] {
                queue.enqueue(make_message(priority)).await.unwrap();
            }
            while queue.dequeue("bench-worker").await.unwrap().is_some() {}
        })
    });
}

criterion_group!(benches, bench_enqueue_dequeue, bench_mixed_priority_drain);
criterion_main!(benches);
