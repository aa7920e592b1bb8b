/*
 * Copyright 2019 The Regents of the University of California
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use rfdemux::channel::{Channel, FrequencyEntry, Modulation};
use rfdemux::fft_stage::FftFrontStage;
use rfdemux::input::{InputFormat, SampleFormat};
use rfdemux::ringbuffer::RingBuffer;

fn benchmark_ring_append(c: &mut Criterion) {
    let block = vec![0u8; 4096];
    let mut group = c.benchmark_group("ring_buffer_append");
    group.bench_function("4096_bytes", |b| {
        let ring = RingBuffer::new(1 << 20, 0);
        b.iter(|| ring.append(&block));
    });
    group.finish();
}

fn benchmark_fft_front_stage(c: &mut Criterion) {
    const FFT_SIZE: usize = 2048;
    let fmt = InputFormat { sample_format: SampleFormat::U8, fullscale: 127.5, sample_rate: 2_000_000 };
    let bytes_per_sample = fmt.sample_format.bytes_per_sample();
    // One window's worth of raw bytes, enough for exactly one run_round.
    let block = vec![128u8; FFT_SIZE * bytes_per_sample * 2];

    let mut group = c.benchmark_group("fft_front_stage_run_round");
    group.bench_function("fft_size_2048", |b| {
        b.iter_batched(
            || {
                let ring = RingBuffer::new(1 << 16, FFT_SIZE * bytes_per_sample * 2);
                ring.append(&block);
                let freq = FrequencyEntry::new(0, "f0", Modulation::Am);
                let channels = vec![Channel::new(250, false, freq)];
                let fft = FftFrontStage::new(FFT_SIZE, 1, 1);
                (ring, channels, fft)
            },
            |(ring, mut channels, mut fft)| {
                fft.run_round(&ring, &fmt, &mut channels);
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, benchmark_ring_append, benchmark_fft_front_stage);
criterion_main!(benches);
