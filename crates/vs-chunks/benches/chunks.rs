use vs_chunks::{chunk_data, ChunkSizes, Indexer};
use vs_crypto::Secret;

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn fastcdc_chunk(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| chunk_data(divan::black_box(&data), ChunkSizes::SMALL));
}

#[divan::bench(args = [65536, 1048576, 10485760])]
fn index_file(bencher: divan::Bencher, size: usize) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.bin");
    std::fs::write(&path, make_data(size)).unwrap();
    let indexer = Indexer::new(Secret::generate().unwrap(), dir.path(), ChunkSizes::SMALL).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| indexer.index_entry(divan::black_box(&path), None).unwrap());
}

fn main() {
    divan::main();
}
