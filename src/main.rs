use sackdb::session::BlockDbIo;
use sackdb::SackConfig;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Sackdb - A block storage engine with undo-log recovery");
    println!("======================================================\n");

    let db_path = "demo.db";
    let log_path = sackdb::session::log_path_for(db_path);

    let mut io = BlockDbIo::open(db_path, SackConfig::default().with_pool_size(8))
        .expect("Failed to open database");
    println!("Opened database: {}", db_path);

    // First transaction: place a few objects and commit them
    let records = [
        b"Hello, World!".as_slice(),
        b"This is Sackdb",
        b"A block storage engine in Rust",
    ];
    let mut ptrs = Vec::new();
    for record in &records {
        let ptr = io
            .compute_new_node_position()
            .expect("Failed to place object");
        io.objseek(ptr).expect("Failed to seek");
        io.write_bytes(record).expect("Failed to write object");
        io.record_new_node_position()
            .expect("Failed to record position");
        println!("Wrote object at {}", ptr);
        ptrs.push(ptr);
    }
    io.set_key_count(records.len() as i64);
    io.dealloc_outstanding_commit().expect("Failed to commit");
    println!("\nCommitted {} objects", records.len());

    // Second transaction: overwrite the first object, then roll back
    io.objseek(ptrs[0]).expect("Failed to seek");
    io.write_bytes(b"Goodbye, World").expect("Failed to write object");
    io.flush_all().expect("Failed to flush");
    println!(
        "Overwrote object at {}, undo log holds {} entries",
        ptrs[0],
        io.undo_log().num_entries()
    );
    let summary = io
        .dealloc_outstanding_rollback()
        .expect("Failed to roll back");
    println!("Rolled back {} entries\n", summary.entries);

    // Read everything back
    for (ptr, record) in ptrs.iter().zip(&records) {
        let mut buf = vec![0u8; record.len()];
        io.objseek(*ptr).expect("Failed to seek");
        io.read_bytes(&mut buf).expect("Failed to read object");
        println!("Object at {}: {:?}", ptr, String::from_utf8_lossy(&buf));
    }
    println!("Key count: {}", io.key_count());
    io.dealloc_outstanding();

    // Clean up
    drop(io);
    std::fs::remove_file(db_path).ok();
    std::fs::remove_file(log_path).ok();
    println!("\nDemo completed successfully!");
}
