use agent_core::{estimate_tokens, trim_history, Message, ToolCall};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn create_messages(count: usize, text_size: usize) -> Vec<Message> {
    let text = "a".repeat(text_size);
    (0..count)
        .map(|i| {
            if i == 0 {
                Message::system(&text)
            } else if i % 2 == 0 {
                Message::user(&text)
            } else {
                Message::assistant(&text)
            }
        })
        .collect()
}

fn create_messages_with_tools(count: usize) -> Vec<Message> {
    let mut messages = vec![Message::system("You are a helpful assistant")];

    for i in 0..count {
        if i % 3 == 0 {
            messages.push(Message::user("Calculate 2 + 2"));
        } else if i % 3 == 1 {
            let call = ToolCall { id: format!("tool_{i}"), name: "calculator".to_string(), arguments: r#"{"operation":"add","a":2,"b":2}"#.to_string() };
            messages.push(Message::assistant_with_tool_calls("", vec![call]));
        } else {
            messages.push(Message::tool(format!("tool_{}", i - 1), r#"{"result":4}"#));
        }
    }

    messages
}

fn bench_estimate_tokens_by_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_tokens_by_count");

    for count in [0, 1, 5, 10, 20, 50, 100].iter() {
        let messages = create_messages(*count, 100);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| estimate_tokens(black_box(msgs)));
        });
    }

    group.finish();
}

fn bench_estimate_tokens_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_tokens_by_size");

    for size in [10, 100, 1000, 10000].iter() {
        let messages = create_messages(10, *size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &messages, |b, msgs| {
            b.iter(|| estimate_tokens(black_box(msgs)));
        });
    }

    group.finish();
}

fn bench_estimate_tokens_with_tools(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_tokens_with_tools");

    for count in [3, 9, 30, 90].iter() {
        let messages = create_messages_with_tools(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| estimate_tokens(black_box(msgs)));
        });
    }

    group.finish();
}

fn bench_trim_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("trim_history");

    let test_cases = vec![
        ("small_budget_2k", create_messages(20, 100), 2_000i64),
        ("medium_budget_5k", create_messages(50, 100), 5_000i64),
        ("large_budget_10k", create_messages(100, 100), 10_000i64),
    ];

    for (name, messages, budget) in test_cases {
        group.bench_with_input(BenchmarkId::new(name, format!("{}/{budget}", messages.len())), &(messages, budget), |b, (msgs, budget)| {
            b.iter(|| trim_history(black_box(msgs), black_box(*budget)));
        });
    }

    group.finish();
}

fn bench_trim_history_with_tools(c: &mut Criterion) {
    let mut group = c.benchmark_group("trim_history_with_tools");

    for count in [30, 90].iter() {
        let messages = create_messages_with_tools(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &messages, |b, msgs| {
            b.iter(|| trim_history(black_box(msgs), black_box(4_000)));
        });
    }

    group.finish();
}

fn bench_realistic_workflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("realistic_workflow");

    let messages = create_messages(50, 200);

    group.bench_function("check_and_trim", |b| {
        b.iter(|| {
            let msgs = black_box(&messages);
            let tokens = estimate_tokens(msgs);
            if tokens > black_box(2_500) {
                trim_history(msgs, black_box(10_000))
            } else {
                msgs.to_vec()
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_estimate_tokens_by_count,
    bench_estimate_tokens_by_size,
    bench_estimate_tokens_with_tools,
    bench_trim_history,
    bench_trim_history_with_tools,
    bench_realistic_workflow,
);
criterion_main!(benches);
