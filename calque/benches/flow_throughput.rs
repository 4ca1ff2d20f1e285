//! Throughput benchmark: bytes/sec through a `Flow` chain of varying length.
//!
//! Tests the PUBLIC API (`calque::prelude`), discarding output so the
//! measurement isolates pipe/handler-chain overhead from conversion cost.

use bytes::Bytes;
use calque::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const MESSAGE_SIZES: &[usize] = &[64, 1024, 16384, 65536];
const CHAIN_LENGTHS: &[usize] = &[1, 4, 8];

fn identity_handler() -> impl Handler {
    FnHandler::new(|mut req: Request, mut res: Response| async move {
        let ctx = req.ctx().clone();
        loop {
            match req.source_mut().read(64 * 1024, ctx.cancelled()).await? {
                Some(chunk) => res.sink_mut().write(chunk, ctx.cancelled()).await.map(|_| ())?,
                None => return Ok(()),
            }
        }
    })
}

fn flow_throughput(c: &mut Criterion) {
    calque::dev_tracing::init_tracing();
    let rt = compio::runtime::Runtime::new().unwrap();

    for &chain_len in CHAIN_LENGTHS {
        let mut group = c.benchmark_group(format!("flow_throughput/chain_{chain_len}"));
        for &size in MESSAGE_SIZES {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                let payload = Bytes::from(vec![0x5Au8; size]);
                b.iter(|| {
                    rt.block_on(async {
                        let mut flow = Flow::new(FlowConfig::new());
                        for _ in 0..chain_len {
                            flow = flow.append(identity_handler());
                        }
                        flow.run(
                            Context::background(),
                            Input::Bytes(black_box(payload.clone())),
                            Output::Discard,
                        )
                        .await
                        .unwrap();
                    });
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, flow_throughput);
criterion_main!(benches);
