use super::BencodeValue;

/// Encode a BencodeValue into its byte representation
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BencodeValue::Bytes(b) => write_byte_string(b, out),
        BencodeValue::List(items) => {
            out.push(b'l');
            for item in items {
                write_value(item, out);
            }
            out.push(b'e');
        }
        BencodeValue::Dict(entries) => {
            out.push(b'd');
            for (key, value) in entries {
                write_byte_string(key, out);
                write_value(value, out);
            }
            out.push(b'e');
        }
    }
}

fn write_byte_string(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
