use vs_crypto::{chunk::seal_chunk, open_chunk, FolderKeys, Secret, SignedMeta};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_seal_chunk(bencher: divan::Bencher, size: usize) {
    let keys = FolderKeys::from_root([0xABu8; 32]).unwrap();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| seal_chunk(divan::black_box(&keys), divan::black_box(&data)).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_open_chunk(bencher: divan::Bencher, size: usize) {
    let keys = FolderKeys::from_root([0xABu8; 32]).unwrap();
    let sealed = seal_chunk(&keys, &make_data(size)).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            open_chunk(
                divan::black_box(&keys),
                divan::black_box(&sealed.info),
                divan::black_box(&sealed.ciphertext),
            )
            .unwrap()
        });
}

#[divan::bench]
fn bench_verify_signed_meta(bencher: divan::Bencher) {
    let secret = Secret::generate().unwrap();
    let keys = secret.keys().unwrap();
    let meta = vs_crypto::MetaInfo {
        path_id: vs_crypto::path_id(keys, "bench/file.bin"),
        revision: 1,
        kind: vs_crypto::EntryKind::File,
        encrypted_path: vs_crypto::encrypt_path(keys, "bench/file.bin").unwrap(),
        mtime: 0,
        mode: 0o644,
        symlink_target: None,
        min_chunksize: 0,
        max_chunksize: 0,
        chunks: (0..64)
            .map(|i| seal_chunk(keys, &[i as u8; 32]).unwrap().info)
            .collect(),
    };
    let smeta = SignedMeta::sign(meta, &secret).unwrap();
    bencher.bench(|| divan::black_box(&smeta).is_valid(&secret));
}

fn main() {
    divan::main();
}
