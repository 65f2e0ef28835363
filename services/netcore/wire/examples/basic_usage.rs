//! Basic usage example for netcore wire framing.

use bytes::BytesMut;
use netcore_wire::{
    block_payload, block_proto_id, check_block, check_http, BlockBuilder, HttpMessage,
    IntegrityResult, Rc4, MAX_BUFF_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== netcore Wire Example ===\n");

    // 1. Build two blocks
    println!("1. Building blocks...");
    let hello = BlockBuilder::new(1).put_str("hello").build(MAX_BUFF_SIZE)?;
    let count = BlockBuilder::new(2).put_u32(42).build(MAX_BUFF_SIZE)?;
    println!("   hello: {} bytes, count: {} bytes", hello.len(), count.len());

    // 2. Encrypt the stream as a sender would
    println!("\n2. Encrypting the stream with RC4...");
    let mut stream = BytesMut::new();
    stream.extend_from_slice(&hello);
    stream.extend_from_slice(&count);
    Rc4::new(b"demo-key")?.apply(&mut stream);

    // 3. Receive it in uneven pieces and frame it
    println!("\n3. Receiving in 5-byte reads...");
    let mut receiver = Rc4::new(b"demo-key")?;
    let mut buf = BytesMut::new();
    for piece in stream.chunks(5) {
        let start = buf.len();
        buf.extend_from_slice(piece);
        receiver.apply(&mut buf[start..]);

        loop {
            match check_block(&buf, MAX_BUFF_SIZE) {
                IntegrityResult::Success(n) => {
                    let block = buf.split_to(n);
                    println!(
                        "   block proto={} payload={:?}",
                        block_proto_id(&block)?,
                        block_payload(&block)?
                    );
                }
                IntegrityResult::Shortage(_) => break,
                IntegrityResult::Corruption => return Err("corrupt stream".into()),
            }
        }
    }

    // 4. Parse a chunked HTTP request
    println!("\n4. Parsing a chunked HTTP request...");
    let request = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwire\r\n0\r\n\r\n";
    let mut msg = HttpMessage::default();
    let mut offset = 0;
    let mut had_header = false;
    while offset < request.len() {
        match check_http(&request[offset..], MAX_BUFF_SIZE, had_header, &mut msg) {
            IntegrityResult::Success(n) => {
                println!("   {} chunk={:?}", msg, String::from_utf8_lossy(&msg.body));
                offset += n;
                had_header = msg.is_chunked && !msg.is_last_chunk();
            }
            other => return Err(format!("unexpected {}", other).into()),
        }
    }

    println!("\n=== Done ===");
    Ok(())
}
