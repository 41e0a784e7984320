use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mend::cache::Cache;
use mend::heal::{parse_healing_response, HealStatus, Risk, Strategy};
use mend::history::HealingAttempt;
use mend::results::{parse_heuristic, parse_runner_output, ExecutionStatus};
use mend::signatures::extract_signatures;

fn synthetic_module(function_count: usize) -> String {
    let mut out = String::from("import { Money } from './money';\n\n");
    for i in 0..function_count {
        match i % 3 {
            0 => out.push_str(&format!(
                "export function total{i}(items: Money[], rate: number = 0.2): Money {{\n  return items.reduce((a, b) => a.add(b), Money.zero()).scale(1 + rate);\n}}\n\n"
            )),
            1 => out.push_str(&format!(
                "export const fetch{i} = async (id: string, opts?: {{ retry: boolean }}): Promise<Order> => {{\n  return client.get(`/orders/${{id}}`, opts);\n}};\n\n"
            )),
            _ => out.push_str(&format!(
                "export class Service{i} {{\n  constructor(private readonly repo: Repo) {{}}\n\n  async find(id: string): Promise<Order | null> {{\n    return this.repo.find(id);\n  }}\n}}\n\n"
            )),
        }
    }
    out
}

fn synthetic_jest_json(case_count: usize) -> String {
    let cases: Vec<_> = (0..case_count)
        .map(|i| {
            let failed = i % 10 == 0;
            serde_json::json!({
                "ancestorTitles": ["suite", format!("group {}", i % 20)],
                "title": format!("case {i}"),
                "status": if failed { "failed" } else { "passed" },
                "duration": i % 40,
                "failureMessages": if failed {
                    vec![format!("Error: expect(received).toEqual(expected)\n\nExpected: {i}\nReceived: 0\n    at Object.<anonymous> (src/a.test.ts:{i}:10)\n    at node_modules/jest-circus/build/utils.js:298:28")]
                } else {
                    Vec::new()
                },
            })
        })
        .collect();
    serde_json::json!({
        "testResults": [{ "name": "src/a.test.ts", "status": "failed", "message": "", "assertionResults": cases }]
    })
    .to_string()
}

fn synthetic_console_output(case_count: usize) -> String {
    let mut out = String::from(" FAIL  src/a.test.ts\n  suite\n");
    for i in 0..case_count {
        if i % 10 == 0 {
            out.push_str(&format!("    \u{2715} case {i} (4 ms)\n"));
        } else {
            out.push_str(&format!("    \u{2713} case {i} (1 ms)\n"));
        }
    }
    for i in (0..case_count).step_by(10) {
        out.push_str(&format!(
            "\n  \u{25cf} suite \u{203a} case {i}\n\n    expect(received).toBe(expected)\n\n    Expected: {i}\n    Received: 0\n\n      at Object.<anonymous> (src/a.test.ts:{i}:10)\n"
        ));
    }
    out.push_str(&format!(
        "\nTests:       {} failed, {} passed, {} total\n",
        case_count / 10,
        case_count - case_count / 10,
        case_count
    ));
    out
}

fn bench_extract_signatures(c: &mut Criterion) {
    let source = synthetic_module(600);
    c.bench_function("extract_signatures_600", |b| {
        b.iter(|| black_box(extract_signatures(black_box(&source)).len()));
    });
}

fn bench_runner_output(c: &mut Criterion) {
    let json = synthetic_jest_json(2_000);
    c.bench_function("parse_runner_output_structured_2000", |b| {
        b.iter(|| black_box(parse_runner_output(Some(black_box(&json)), "", "").totals.total));
    });

    let console = synthetic_console_output(2_000);
    c.bench_function("parse_heuristic_2000", |b| {
        b.iter(|| black_box(parse_heuristic(black_box(&console)).totals.total));
    });
}

fn bench_healing_response(c: &mut Criterion) {
    let fixed = synthetic_module(40);
    let strict = serde_json::json!({
        "root_cause": "rate applied twice",
        "strategy": "LOGIC_FIX",
        "confidence": 82,
        "risk": "LOW",
        "target": "source",
        "fixed_source": fixed,
    })
    .to_string();
    let tagged = format!(
        "Here is my analysis.\n<root_cause>rate applied twice</root_cause>\n<strategy>LOGIC_FIX</strategy>\n<confidence>82</confidence>\n<risk>LOW</risk>\n<fixed_source>\n{}\n</fixed_source>\n",
        fixed
    );

    c.bench_function("parse_healing_response_strict", |b| {
        b.iter(|| black_box(parse_healing_response(black_box(&strict)).is_ok()));
    });
    c.bench_function("parse_healing_response_tags", |b| {
        b.iter(|| black_box(parse_healing_response(black_box(&tagged)).is_ok()));
    });
}

fn bench_history_load(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = Cache::new(temp.path());
    let path = cache.attempts_path("src/cart.ts");
    for n in 1..=500u32 {
        let attempt = HealingAttempt {
            attempt_number: n % 5 + 1,
            run_id: format!("run-{}", n / 5),
            file: "src/cart.ts".to_string(),
            root_cause: format!("cause {n}"),
            strategy: Strategy::LogicFix,
            confidence: 70,
            risk: Risk::Low,
            replacement: None,
            status: HealStatus::Failed,
            commit_published: false,
            commit_ref: None,
            execution_status: ExecutionStatus::Fail,
            recorded_at: Utc::now(),
        };
        cache.append_jsonl(&path, &attempt).expect("append attempt");
    }

    c.bench_function("history_load_500", |b| {
        b.iter(|| {
            let loaded: Vec<HealingAttempt> = cache.read_jsonl(&path).expect("read attempts");
            black_box(loaded.len());
        });
    });
}

criterion_group!(
    perf_core,
    bench_extract_signatures,
    bench_runner_output,
    bench_healing_response,
    bench_history_load
);
criterion_main!(perf_core);
