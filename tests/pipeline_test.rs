//! Pipeline composition and round-trip properties.

use bytes::{Bytes, BytesMut};

use basalt::minecraft::codec::{
    Cfb8Codec, Flow, FrameCodec, PacketPipeline, RegistryCodec, Stage, ZlibCodec, CFB8, FRAME,
    REGISTRY, ZLIB,
};
use basalt::minecraft::packet::{GenericPacket, Packet};
use basalt::minecraft::version::V1_12_1;

fn play_pipeline(flow: Flow) -> PacketPipeline {
    let mut pipeline = PacketPipeline::new();
    pipeline.add_last(Stage::Frame(FrameCodec)).unwrap();
    pipeline
        .add_last(Stage::Registry(RegistryCodec::play(&V1_12_1, flow)))
        .unwrap();
    pipeline
}

fn generic(id: i32, len: usize) -> Packet {
    Packet::Generic(GenericPacket {
        id,
        body: Bytes::from(vec![0xAB; len]),
    })
}

/// Feeds encoded bytes into a pipeline and decodes exactly one packet.
fn roundtrip(encoder: &mut PacketPipeline, decoder: &mut PacketPipeline, packet: &Packet) -> Packet {
    let bytes = encoder.encode(packet).unwrap();
    let mut raw = BytesMut::from(&bytes[..]);
    let mut frame = BytesMut::new();
    let decoded = decoder
        .decode_step(&mut raw, &mut frame)
        .unwrap()
        .expect("one full frame was fed");
    assert!(raw.is_empty());
    assert!(frame.is_empty());
    decoded
}

#[test]
fn standard_compositions() {
    // initial
    let mut pipeline = PacketPipeline::new();
    pipeline.add_last(Stage::Frame(FrameCodec)).unwrap();
    pipeline
        .add_last(Stage::Registry(RegistryCodec::handshake(Flow::Player)))
        .unwrap();
    assert_eq!(pipeline.stage_names(), vec![FRAME, REGISTRY]);

    // after encryption: cfb8 goes in front of the framing
    pipeline
        .add_before(FRAME, Stage::Cfb8(Cfb8Codec::new(&[1u8; 16]).unwrap()))
        .unwrap();
    assert_eq!(pipeline.stage_names(), vec![CFB8, FRAME, REGISTRY]);

    // after compression: zlib goes right before the registry
    pipeline
        .add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(256)))
        .unwrap();
    assert_eq!(pipeline.stage_names(), vec![CFB8, FRAME, ZLIB, REGISTRY]);

    // the threshold can be swapped in place without moving the stage
    pipeline.replace(Stage::Zlib(ZlibCodec::new(64))).unwrap();
    assert_eq!(pipeline.stage_names(), vec![CFB8, FRAME, ZLIB, REGISTRY]);

    // disabling compression removes exactly the zlib stage
    pipeline.remove(ZLIB).unwrap();
    assert_eq!(pipeline.stage_names(), vec![CFB8, FRAME, REGISTRY]);
}

#[test]
fn repeated_threshold_swap_equals_single_swap() {
    let mut once = play_pipeline(Flow::Player);
    once.add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(64)))
        .unwrap();

    let mut twice = play_pipeline(Flow::Player);
    twice
        .add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(512)))
        .unwrap();
    twice.replace(Stage::Zlib(ZlibCodec::new(64))).unwrap();

    assert_eq!(once.stage_names(), twice.stage_names());
    let packet = generic(0x0B, 100);
    let bytes_once = once.encode(&packet).unwrap();
    let bytes_twice = twice.encode(&packet).unwrap();
    assert_eq!(bytes_once, bytes_twice);
}

#[test]
fn frame_zlib_roundtrip_across_thresholds() {
    for threshold in [0i32, 1, 64, 256, 1 << 15] {
        // bodies straddling the threshold on both sides
        for len in [0usize, 1, 63, 64, 255, 256, 1000, (1 << 15) + 10] {
            let mut encoder = play_pipeline(Flow::Server);
            encoder
                .add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(threshold)))
                .unwrap();
            let mut decoder = play_pipeline(Flow::Player);
            decoder
                .add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(threshold)))
                .unwrap();

            let packet = generic(0x0B, len);
            match roundtrip(&mut encoder, &mut decoder, &packet) {
                Packet::Generic(decoded) => {
                    assert_eq!(decoded.id, 0x0B, "threshold {} len {}", threshold, len);
                    assert_eq!(decoded.body.len(), len);
                    assert!(decoded.body.iter().all(|byte| *byte == 0xAB));
                }
                other => panic!("unexpected packet {}", other.kind()),
            }
        }
    }
}

#[test]
fn full_stack_roundtrip_with_cipher() {
    let secret = [42u8; 16];
    let mut encoder = play_pipeline(Flow::Server);
    encoder
        .add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(256)))
        .unwrap();
    encoder
        .add_before(FRAME, Stage::Cfb8(Cfb8Codec::new(&secret).unwrap()))
        .unwrap();
    let mut decoder = play_pipeline(Flow::Player);
    decoder
        .add_before(REGISTRY, Stage::Zlib(ZlibCodec::new(256)))
        .unwrap();
    decoder
        .add_before(FRAME, Stage::Cfb8(Cfb8Codec::new(&secret).unwrap()))
        .unwrap();

    // several packets in sequence: the cipher stream must stay aligned
    for len in [10usize, 300, 5, 1024] {
        let packet = generic(0x0B, len);
        match roundtrip(&mut encoder, &mut decoder, &packet) {
            Packet::Generic(decoded) => assert_eq!(decoded.body.len(), len),
            other => panic!("unexpected packet {}", other.kind()),
        }
    }
}

#[test]
fn ciphered_bytes_differ_from_plaintext() {
    let mut plain = play_pipeline(Flow::Server);
    let mut ciphered = play_pipeline(Flow::Server);
    ciphered
        .add_before(FRAME, Stage::Cfb8(Cfb8Codec::new(&[7u8; 16]).unwrap()))
        .unwrap();
    let packet = generic(0x0B, 32);
    assert_ne!(
        plain.encode(&packet).unwrap(),
        ciphered.encode(&packet).unwrap()
    );
}
