#![cfg(feature = "hdf5")]

use hdf5::types::FixedAscii;
use hdf5::File;
use imswrite_core::PixelBuffer;
use imswrite_io::{ImsWriter, WriterConfig};
use tempfile::tempdir;

fn text_attr(location: &hdf5::Location, name: &str) -> String {
    let chars: Vec<FixedAscii<1>> = location.attr(name).unwrap().read_raw().unwrap();
    chars.iter().map(|c| c.as_str()).collect()
}

#[test]
fn test_ims_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cube.ims");

    let config = WriterConfig::new(4, 4, 4).with_max_level_bytes(1);
    let mut writer = ImsWriter::create(path.clone(), config).unwrap();
    for z in 0..4 {
        writer
            .submit_plane(
                PixelBuffer::from(vec![40u8; 16]),
                z,
                0,
                0,
                Some("2024-05-06 07:08:09.010"),
            )
            .unwrap();
    }
    writer.close().unwrap();

    let file = File::open(&path).unwrap();
    assert_eq!(text_attr(&file, "ImarisVersion"), "5.5.0");
    let count: Vec<u32> = file.attr("NumberOfDataSets").unwrap().read_raw().unwrap();
    assert_eq!(count, vec![1]);

    let image = file.group("DataSetInfo/Image").unwrap();
    assert_eq!(text_attr(&image, "X"), "4");
    assert_eq!(text_attr(&image, "RecordingDate"), "2024-05-06 07:08:09.010");

    for (level, size) in [(0, 4usize), (1, 2), (2, 1)] {
        let channel = file
            .group(&format!("DataSet/ResolutionLevel {level}/TimePoint 0/Channel 0"))
            .unwrap();
        assert_eq!(text_attr(&channel, "ImageSizeX"), size.to_string());

        let data = channel.dataset("Data").unwrap();
        let shape = data.shape();
        assert!(shape[0] >= size && shape[1] >= size && shape[2] >= size);
        let values: Vec<u8> = data.read_raw().unwrap();
        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    assert_eq!(values[(z * shape[1] + y) * shape[2] + x], 40);
                }
            }
        }

        let histogram: Vec<u64> = channel.dataset("Histogram").unwrap().read_raw().unwrap();
        assert_eq!(histogram.len(), 256);
        assert_eq!(histogram[39], 64);
    }
}
