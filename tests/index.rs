use kmatch::encode::KmerCodec;
use kmatch::{Codec, IndexConfig, KmerError, KmerIndex};

#[test]
fn test_insert_is_idempotent() {
    let idx = KmerIndex::new(3, Codec::Packed).unwrap();
    assert!(idx.insert_str("AAC").unwrap());
    assert!(!idx.insert_str("AAC").unwrap());
    // reverse complement maps to the same canonical key
    assert!(!idx.insert_str("GTT").unwrap());
    assert_eq!(idx.len(), 1);
    assert!(idx.contains_str("gtt"));
    assert!(!idx.contains_str("CCC"));
    // wrong length never matches
    assert!(!idx.contains_str("AA"));
}

#[test]
fn test_concurrent_inserts_create_one_entry() {
    let idx = KmerIndex::new(21, Codec::Packed).unwrap();
    let key = Codec::Packed
        .encode_canonical(b"ACGTTGCAAGGCTTACCGATC")
        .unwrap();
    let threads = 16;

    let inserted: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let key = key.clone();
                let idx = &idx;
                s.spawn(move || idx.insert(key).unwrap() as usize)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(inserted, 1);
    assert_eq!(idx.len(), 1);
    std::thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| assert!(idx.contains(&key)));
        }
    });
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let idx = KmerIndex::new(4, Codec::Bytes).unwrap();
    let keys: Vec<_> = ["AAAA", "ACGT", "CCGA", "GATC"]
        .iter()
        .map(|s| Codec::Bytes.encode_canonical(s.as_bytes()).unwrap())
        .collect();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..1000 {
                    for key in &keys {
                        idx.increment(key.clone(), 1).unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(idx.len(), keys.len());
    for key in &keys {
        assert_eq!(idx.count(key), Some(8000));
    }
}

#[test]
fn test_capacity_limit() {
    let idx = KmerIndex::with_config(3, Codec::Packed, IndexConfig::default().max_keys(2)).unwrap();
    idx.insert_str("AAA").unwrap();
    idx.insert_str("AAC").unwrap();
    // existing keys are still fine
    assert!(!idx.insert_str("AAA").unwrap());
    match idx.insert_str("CCC") {
        Err(KmerError::IndexFull { limit }) => assert_eq!(limit, 2),
        other => panic!("expected IndexFull, got {other:?}"),
    }
    assert_eq!(idx.len(), 2);
    assert!(KmerError::IndexFull { limit: 2 }.is_fatal());
}

#[test]
fn test_dump_is_sorted() {
    for codec in [Codec::Packed, Codec::Bytes] {
        let idx = KmerIndex::with_config(5, codec, IndexConfig::default().prefix_bases(2)).unwrap();
        for s in ["TTTTT", "GATTA", "CCCAA", "ACGTA", "GGGGA", "CATCA"] {
            idx.insert_str(s).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(idx.dump(&mut out).unwrap(), 6);
        let text = String::from_utf8(out).unwrap();
        let kmers: Vec<&str> = text.lines().map(|l| l.split('\t').next().unwrap()).collect();
        let mut sorted = kmers.clone();
        sorted.sort();
        assert_eq!(kmers, sorted);
        // TTTTT is stored as its canonical AAAAA
        assert_eq!(kmers[0], "AAAAA");
        assert!(text.lines().all(|l| l.ends_with("\t0")));
    }
}

#[test]
fn test_for_each_sorted_visits_keys_in_order() {
    let idx = KmerIndex::with_config(4, Codec::Packed, IndexConfig::default().prefix_bases(1)).unwrap();
    let enc = |s: &str| Codec::Packed.encode_canonical(s.as_bytes()).unwrap();
    for (s, n) in [("TGCA", 1), ("GTTC", 3), ("CCTA", 2), ("AGGT", 4), ("ATTA", 1)] {
        idx.increment(enc(s), n).unwrap();
    }

    let mut seen = Vec::new();
    idx.for_each_sorted(|key, count| seen.push((key.clone(), count)));
    assert_eq!(seen.len(), idx.len());
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));

    let text: Vec<String> = seen
        .iter()
        .map(|(key, _)| String::from_utf8(Codec::Packed.decode(key, 4).unwrap()).unwrap())
        .collect();
    let mut sorted = text.clone();
    sorted.sort();
    assert_eq!(text, sorted);
    // GTTC is stored as its canonical GAAC
    let gaac = text.iter().position(|t| t == "GAAC").unwrap();
    assert_eq!(seen[gaac].1, 3);
    assert!(!text.iter().any(|t| t == "GTTC"));
}

#[test]
fn test_retain_min_count() {
    let mut idx = KmerIndex::new(3, Codec::Packed).unwrap();
    let enc = |s: &str| Codec::Packed.encode_canonical(s.as_bytes()).unwrap();
    idx.increment(enc("AAA"), 5).unwrap();
    idx.increment(enc("ACG"), 1).unwrap();
    idx.increment(enc("CCA"), 2).unwrap();
    assert_eq!(idx.retain_min_count(2), 1);
    assert_eq!(idx.len(), 2);
    assert!(idx.contains_str("TTT"));
    assert!(!idx.contains_str("ACG"));
}

#[test]
fn test_rejects_bad_k() {
    assert!(KmerIndex::new(0, Codec::Packed).is_err());
    assert!(KmerIndex::new(256, Codec::Packed).is_err());
    let idx = KmerIndex::new(2, Codec::Packed).unwrap();
    // prefix clamped to k
    assert_eq!(idx.shard_count(), 16);
}
