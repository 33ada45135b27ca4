//! Generate framed test vectors for cross-implementation interop testing.
//!
//! Run with: cargo run --package ptymux-protocol --example test_vectors

use ptymux_protocol::{Envelope, FrameCodec, MessageKind};

fn main() {
    let codec = FrameCodec::new();

    // Test vector 1: zero-valued envelope
    print_test_vector(&codec, "empty", &Envelope::default());

    // Test vector 2: output chunk
    print_test_vector(&codec, "output", &Envelope::output("term1", b"hi".to_vec()));

    // Test vector 3: keystrokes with an escape sequence
    print_test_vector(
        &codec,
        "input_arrow_up",
        &Envelope::input("term1", vec![0x1B, b'[', b'A']),
    );

    // Test vector 4: resize
    print_test_vector(&codec, "resize", &Envelope::resize("term1", 80, 24));

    // Test vector 5: connection-level error
    print_test_vector(&codec, "error", &Envelope::error("remote process exited"));

    // Test vector 6: kind without payload
    print_test_vector(&codec, "kind_only", &Envelope::new(MessageKind::Input));
}

fn print_test_vector(codec: &FrameCodec, name: &str, envelope: &Envelope) {
    let bytes = codec.encode(envelope).expect("encoding failed");
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
