use kmatch::encode::*;
use proptest::prelude::*;

fn kmer(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"ACGTacgt".to_vec()), 1..max)
}

fn codec() -> impl Strategy<Value = Codec> {
    prop::sample::select(vec![Codec::Bytes, Codec::Packed])
}

proptest! {
    #[test]
    fn prop_canonical_idempotent(s in kmer(80)) {
        let c = canonicalize(&s).unwrap();
        prop_assert_eq!(canonicalize(&c).unwrap(), c);
    }

    #[test]
    fn prop_canonical_strand_symmetric(s in kmer(80)) {
        let rc = revcomp(&s).unwrap();
        prop_assert_eq!(canonicalize(&s).unwrap(), canonicalize(&rc).unwrap());
    }

    #[test]
    fn prop_codec_roundtrip(s in kmer(200), codec in codec()) {
        let c = canonicalize(&s).unwrap();
        let key = codec.encode(&c).unwrap();
        prop_assert_eq!(codec.decode(&key, c.len()).unwrap(), c);
    }

    #[test]
    fn prop_order_matches_text(
        len in 1usize..100,
        seed_a in prop::collection::vec(0u8..4, 100),
        seed_b in prop::collection::vec(0u8..4, 100),
        codec in codec(),
    ) {
        let text = |seed: &[u8]| -> Vec<u8> {
            seed[..len].iter().map(|&v| b"ACGT"[v as usize]).collect()
        };
        let a = canonicalize(&text(&seed_a)).unwrap();
        let b = canonicalize(&text(&seed_b)).unwrap();
        let ka = codec.encode(&a).unwrap();
        let kb = codec.encode(&b).unwrap();
        prop_assert_eq!(codec.compare(&ka, &kb), a.cmp(&b));
    }

    // Rolling dual-encode scanning and per-window canonicalization agree.
    #[test]
    fn prop_rolling_windows_agree(
        k in 1usize..=40,
        seq in prop::collection::vec(prop::sample::select(b"ACGTNacgt".to_vec()), 0..200),
    ) {
        let rolling: Vec<_> = CanonicalWindows::new(&seq, k, Codec::Packed).collect();
        let naive: Vec<_> = if seq.len() < k {
            Vec::new()
        } else {
            seq.windows(k).map(|w| PackedCodec.encode_canonical(w).ok()).collect()
        };
        prop_assert_eq!(rolling, naive);
    }
}
