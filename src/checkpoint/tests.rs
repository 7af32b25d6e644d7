//! Unit tests for the GGUF checkpoint format.
//!
//! Tests cover: header and metadata parsing, F16/F32 decoding, writer/reader
//! agreement, and loading a partial checkpoint over initial parameters.

#[cfg(test)]
mod tests {
    use crate::checkpoint::*;

    // =========================================================================
    // Hand-built GGUF images (independent of GgufWriter)
    // =========================================================================

    fn write_gguf_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Build a GGUF v3 image with one F16 tensor and two metadata entries
    /// (one string, one u32 that the reader has to skip).
    fn build_f16_gguf(tensor_name: &str, dims: &[u64], values: &[f32]) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&0x46554747u32.to_le_bytes()); // magic "GGUF"
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&1u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&2u64.to_le_bytes()); // metadata_kv_count

        write_gguf_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&8u32.to_le_bytes()); // STRING
        write_gguf_string(&mut buf, "melgan");

        write_gguf_string(&mut buf, "melgan.hop_length");
        buf.extend_from_slice(&4u32.to_le_bytes()); // UINT32
        buf.extend_from_slice(&256u32.to_le_bytes());

        write_gguf_string(&mut buf, tensor_name);
        buf.extend_from_slice(&(dims.len() as u32).to_le_bytes());
        for &dim in dims {
            buf.extend_from_slice(&dim.to_le_bytes());
        }
        buf.extend_from_slice(&1u32.to_le_bytes()); // dtype: F16
        buf.extend_from_slice(&0u64.to_le_bytes()); // offset

        let padding = (32 - (buf.len() % 32)) % 32;
        buf.extend(std::iter::repeat_n(0u8, padding));

        for &v in values {
            buf.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        buf
    }

    // =========================================================================
    // Reader
    // =========================================================================

    #[test]
    fn test_reader_parses_f16_tensor_and_metadata() {
        let values: Vec<f32> = (0..6).map(|i| i as f32 * 0.5 - 1.0).collect();
        // innermost first: 3 columns, 2 rows
        let bytes = build_f16_gguf("decoder.conv_pre.bias", &[3, 2], &values);

        let mut reader = GgufReader::from_bytes(&bytes).expect("Failed to parse GGUF");
        assert_eq!(reader.version(), 3);
        assert_eq!(reader.tensor_count(), 1);
        assert_eq!(reader.metadata_str("general.architecture"), Some("melgan"));
        assert_eq!(reader.metadata_str("melgan.hop_length"), None);

        let info = reader.tensor_info("decoder.conv_pre.bias").unwrap();
        assert_eq!(info.shape(), &[3, 2]);
        assert_eq!(info.row_major_shape(), vec![2, 3]);
        assert_eq!(info.dtype(), GgmlDtype::F16);

        let decoded = reader.tensor_f32("decoder.conv_pre.bias").unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_reader_rejects_bad_magic() {
        let mut bytes = build_f16_gguf("x", &[1], &[0.0]);
        bytes[0] = b'X';
        let err = GgufReader::from_bytes(&bytes).err().unwrap().to_string();
        assert!(err.contains("magic"), "{err}");
    }

    #[test]
    fn test_reader_rejects_quantized_tensors() {
        let mut bytes = build_f16_gguf("x", &[32], &[0.0; 32]);
        // dtype field follows name (8 + 1), ndims (4) and one dim (8)
        let name_end = bytes
            .windows(1)
            .position(|w| w == b"x")
            .expect("tensor name present")
            + 1;
        let dtype_at = name_end + 4 + 8;
        bytes[dtype_at..dtype_at + 4].copy_from_slice(&2u32.to_le_bytes()); // Q4_0
        assert!(GgufReader::from_bytes(&bytes).is_err());
    }

    // =========================================================================
    // Writer
    // =========================================================================

    #[test]
    fn test_writer_output_is_readable() {
        let mut writer = GgufWriter::new().architecture("melvae");
        let w: Vec<f32> = (0..24).map(|i| i as f32).collect();
        writer
            .add_tensor("encoder.convs.0.weight", &[4, 2, 3], w.clone())
            .unwrap();
        writer
            .add_tensor("encoder.convs.0.bias", &[4], vec![0.5; 4])
            .unwrap();
        let bytes = writer.to_bytes();

        let mut reader = GgufReader::from_bytes(&bytes).unwrap();
        assert_eq!(reader.metadata_str("general.architecture"), Some("melvae"));
        assert_eq!(
            reader.tensor_names(),
            vec!["encoder.convs.0.weight", "encoder.convs.0.bias"]
        );
        let info = reader.tensor_info("encoder.convs.0.weight").unwrap();
        assert_eq!(info.shape(), &[3, 2, 4]);
        assert_eq!(info.row_major_shape(), vec![4, 2, 3]);
        assert_eq!(reader.tensor_f32("encoder.convs.0.weight").unwrap(), w);
        assert_eq!(
            reader.tensor_f32("encoder.convs.0.bias").unwrap(),
            vec![0.5; 4]
        );
    }

    #[test]
    fn test_writer_aligns_tensor_data() {
        // odd name length leaves the header unaligned
        let mut writer = GgufWriter::new().architecture("mel");
        writer.add_tensor("a.b", &[3], vec![1.0, 2.0, 3.0]).unwrap();
        writer.add_tensor("c", &[3], vec![4.0, 5.0, 6.0]).unwrap();
        let bytes = writer.to_bytes();

        // second tensor sits one aligned slot after the first, 12 bytes long
        assert_eq!((bytes.len() - 12) % 32, 0);
        let mut reader = GgufReader::from_bytes(&bytes).unwrap();
        assert_eq!(reader.tensor_f32("a.b").unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(reader.tensor_f32("c").unwrap(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_writer_rejects_bad_shapes_and_duplicates() {
        let mut writer = GgufWriter::new();
        assert!(writer.add_tensor("a", &[2, 2], vec![0.0; 3]).is_err());
        writer.add_tensor("a", &[2], vec![0.0; 2]).unwrap();
        assert!(writer.add_tensor("a", &[2], vec![0.0; 2]).is_err());
    }

    // =========================================================================
    // Store on disk
    // =========================================================================

    #[test]
    fn test_partial_checkpoint_overlay_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vanilla").join("vanilla_state.gguf");

        let template = initialise(
            &[
                ParamSpec::new("encoder.convs.0.weight", vec![4, 2, 3], Init::XavierNormal),
                ParamSpec::new("encoder.convs.0.bias", vec![4], Init::Uniform(0.1)),
            ],
            0,
        );

        let mut checkpoint = ParameterStore::new();
        checkpoint.insert(
            "encoder.convs.0.bias",
            ParamTensor::new(vec![4], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        checkpoint.save(&path, "melvae").unwrap();

        let loaded = ParameterStore::load_over(&template, &path).unwrap();
        assert_eq!(
            loaded.get("encoder.convs.0.bias").unwrap().data,
            vec![1.0, 2.0, 3.0, 4.0]
        );
        assert_eq!(
            loaded.get("encoder.convs.0.weight"),
            template.get("encoder.convs.0.weight")
        );
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ParameterStore::load(&dir.path().join("nope.gguf"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to open checkpoint"), "{err}");
    }

    #[test]
    fn test_incompatible_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.gguf");
        let template = initialise(&[ParamSpec::new("w", vec![2, 2], Init::XavierNormal)], 0);

        let mut checkpoint = ParameterStore::new();
        checkpoint.insert("w", ParamTensor::filled(vec![2, 3], 0.0));
        checkpoint.save(&path, "melvae").unwrap();

        assert!(ParameterStore::load_over(&template, &path).is_err());
    }
}
