#![no_main]

use libfuzzer_sys::fuzz_target;
use nanocol::compressor::{decompress_block, CompressionMeta, Dictionary};

fuzz_target!(|data: &[u8]| {
    let _ = CompressionMeta::decode(data);
    let _ = decompress_block(data, data.len().min(4096));

    let values: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    for dict in [
        Dictionary::categorical(values.iter().map(|v| v.to_vec())),
        Dictionary::bigram(values.iter().copied()),
    ] {
        let enc = dict.encoder();
        for v in &values {
            let mut code = Vec::new();
            enc.encode_into(v, &mut code).unwrap();
            assert!(!code.contains(&b' '));
            assert_eq!(dict.decode(&code).unwrap(), v.to_vec());
        }
        let meta = CompressionMeta::Dictionaries(vec![("c".into(), dict)]);
        assert_eq!(CompressionMeta::decode(&meta.encode()).unwrap(), meta);
    }
});
