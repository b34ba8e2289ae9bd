use common::{Money, SagaId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{ChoreographedSagaStatus, SagaExecution, SagaState, SagaStep, can_transition};
use std::hint::black_box;

fn bench_can_transition(c: &mut Criterion) {
    c.bench_function("domain/can_transition_all_pairs", |b| {
        b.iter(|| {
            let mut allowed = 0;
            for a in SagaState::ALL {
                for t in SagaState::ALL {
                    if can_transition(black_box(a), black_box(t)) {
                        allowed += 1;
                    }
                }
            }
            for a in ChoreographedSagaStatus::ALL {
                for t in ChoreographedSagaStatus::ALL {
                    if can_transition(black_box(a), black_box(t)) {
                        allowed += 1;
                    }
                }
            }
            allowed
        });
    });
}

fn bench_full_forward_path(c: &mut Criterion) {
    c.bench_function("domain/execution_forward_path", |b| {
        b.iter(|| {
            let mut saga =
                SagaExecution::new(SagaId::new(), "C1", "P1", 2, Money::from_cents(5000)).unwrap();
            for step in SagaStep::SEQUENCE {
                saga.complete_step(step).unwrap();
            }
            saga
        });
    });
}

criterion_group!(benches, bench_can_transition, bench_full_forward_path);
criterion_main!(benches);
