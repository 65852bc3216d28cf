#![no_main]

use libfuzzer_sys::fuzz_target;
use nanocol::tablefile::read_section_map;
use nanocol::{ReadOptions, Table};
use std::fs;
use std::path::PathBuf;

fuzz_target!(|data: &[u8]| {
    let _ = read_section_map(data);

    let mut path = std::env::temp_dir();
    path.push(temp_name(data));
    if fs::write(&path, data).is_ok() {
        let read = ReadOptions {
            use_memory_mapping: data.first().is_some_and(|b| b & 1 == 0),
        };
        if let Ok(table) = Table::open(&path, read) {
            let _ = table.column_names();
            for row in 0..table.num_rows().min(256) {
                for col in 0..table.num_columns() {
                    let _ = table.value(row, col);
                }
            }
        }
    }
    let _ = fs::remove_file(&path);
});

fn temp_name(data: &[u8]) -> PathBuf {
    let mut hash = 0u64;
    for &b in data.iter().take(1024) {
        hash = hash.wrapping_mul(131).wrapping_add(b as u64);
    }
    PathBuf::from(format!("nanocol_fuzz_tablefile_{}.nc", hash))
}
