//! Basic usage example for the mesh wire format.

use bytes::Bytes;
use mesh_wire::{
    fragment_packet, Announce, Flags, Packet, PacketBuilder, PacketType, PeerId, Reassembler,
};
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Format Example ===\n");

    // 1. Announce presence
    println!("1. Encoding an ANNOUNCE packet...");
    let announce = Announce {
        sequence: 1,
        nickname: "alice".to_string(),
    };
    let packet = PacketBuilder::new(PacketType::Announce, PeerId(0xA11CE))
        .payload(announce.encode())
        .build();
    let encoded = packet.encode()?;
    println!("   Encoded size: {} bytes", encoded.len());

    // 2. Decode it again
    println!("\n2. Decoding...");
    let decoded = Packet::decode(&encoded)?;
    let announce = Announce::decode(&decoded.payload)?;
    println!(
        "   {} announced as {:?} (ttl {})",
        decoded.source, announce.nickname, decoded.ttl
    );

    // 3. Fragment something larger than one packet
    println!("\n3. Fragmenting a 1500 byte broadcast over a 128 byte MTU...");
    let large = PacketBuilder::new(PacketType::Broadcast, PeerId(0xA11CE))
        .flags(Flags::empty())
        .payload(Bytes::from(vec![0x42u8; 1500]))
        .build();
    let pieces = fragment_packet(&large, 128)?;
    println!("   Split into {} fragment packets", pieces.len());

    // 4. Reassemble in reverse order
    println!("\n4. Reassembling...");
    let reassembler = Reassembler::default();
    let now = Instant::now();
    for piece in pieces.iter().rev() {
        let wire = piece.encode()?;
        if let Some(whole) = reassembler.ingest_packet(&Packet::decode(&wire)?, now)? {
            println!(
                "   Reassembled {:?} with {} payload bytes",
                whole.typ,
                whole.payload.len()
            );
        }
    }

    println!("\n=== Example completed ===");
    Ok(())
}
