//! Reading hand-crafted version 1.2 bags.
//!
//! The legacy layout has no chunks: message-definition and message-data
//! records sit directly in the file, and per-topic index records at the tail
//! point at them. The first entry of each topic index lands on that topic's
//! definition record.

use bytes::{BufMut, BytesMut};
use tempfile::tempdir;

use baghouse_core::record::{
    self, COUNT_FIELD, DEF_FIELD_102, MD5_FIELD_102, OP_FIELD, OP_INDEX_DATA, OP_MSG_DATA,
    OP_MSG_DEF, TIME_FIELD, TOPIC_FIELD, TYPE_FIELD, VER_FIELD,
};
use baghouse_core::{HeaderMap, Time};
use baghouse_storage::{Bag, BagMode, Query, View};

fn encode_record(header: &HeaderMap, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    record::encode_record(&mut buf, header, data);
    buf.to_vec()
}

fn definition_record(topic: &str, datatype: &str, md5: &str, def: &str) -> Vec<u8> {
    let mut header = HeaderMap::new();
    header.put_u8(OP_FIELD, OP_MSG_DEF);
    header.put_str(TOPIC_FIELD, topic);
    header.put_str(TYPE_FIELD, datatype);
    header.put_str(MD5_FIELD_102, md5);
    header.put_str(DEF_FIELD_102, def);
    encode_record(&header, &[])
}

fn message_record(topic: &str, time: Time, payload: &[u8]) -> Vec<u8> {
    let mut header = HeaderMap::new();
    header.put_u8(OP_FIELD, OP_MSG_DATA);
    header.put_str(TOPIC_FIELD, topic);
    header.put_time(TIME_FIELD, time);
    encode_record(&header, payload)
}

fn index_record(topic: &str, entries: &[(Time, u64)]) -> Vec<u8> {
    let mut header = HeaderMap::new();
    header.put_u8(OP_FIELD, OP_INDEX_DATA);
    header.put_u32(VER_FIELD, 0);
    header.put_str(TOPIC_FIELD, topic);
    header.put_u32(COUNT_FIELD, entries.len() as u32);

    let mut data = BytesMut::new();
    for (time, pos) in entries {
        data.put_u32_le(time.sec);
        data.put_u32_le(time.nsec);
        data.put_u64_le(*pos);
    }
    encode_record(&header, &data)
}

fn file_header_record(index_pos: u64) -> Vec<u8> {
    let mut header = HeaderMap::new();
    header.put_u8(OP_FIELD, record::OP_FILE_HEADER);
    header.put_u64(record::INDEX_POS_FIELD, index_pos);
    encode_record(&header, &[b' '; 32])
}

/// Assemble a two-topic legacy bag and return its bytes.
fn build_legacy_bag() -> Vec<u8> {
    let magic = b"#ROSBAG V1.2\n";
    // The file-header record has a fixed width here (u64 index_pos), so its
    // length can be measured with a placeholder value.
    let header_len = file_header_record(0).len();
    let base = magic.len() + header_len;

    let mut body = Vec::new();
    let pos_def_a = (base + body.len()) as u64;
    body.extend_from_slice(&definition_record(
        "/a",
        "test/A",
        "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        "defA",
    ));
    body.extend_from_slice(&message_record("/a", Time::from_sec(1), b"a1"));
    let pos_a3 = (base + body.len()) as u64;
    body.extend_from_slice(&message_record("/a", Time::from_sec(3), b"a3"));

    let pos_def_b = (base + body.len()) as u64;
    body.extend_from_slice(&definition_record(
        "/b",
        "test/B",
        "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        "defB",
    ));
    body.extend_from_slice(&message_record("/b", Time::from_sec(2), b"b2"));

    let index_pos = (base + body.len()) as u64;
    // First index entry of each topic points at the definition record; the
    // reader skips over it to the message that follows.
    body.extend_from_slice(&index_record(
        "/a",
        &[(Time::from_sec(1), pos_def_a), (Time::from_sec(3), pos_a3)],
    ));
    body.extend_from_slice(&index_record("/b", &[(Time::from_sec(2), pos_def_b)]));

    let mut file = Vec::new();
    file.extend_from_slice(magic);
    file.extend_from_slice(&file_header_record(index_pos));
    file.extend_from_slice(&body);
    file
}

#[test]
fn legacy_bag_reads_in_time_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy.bag");
    std::fs::write(&path, build_legacy_bag()).unwrap();

    let bag = Bag::open(&path, BagMode::Read).unwrap();
    assert_eq!(bag.major_version(), 1);
    assert_eq!(bag.minor_version(), 2);

    let view = View::new(&bag).unwrap();
    assert_eq!(view.size(), 3);

    let messages: Vec<(String, u32, Vec<u8>, String)> = view
        .iter()
        .map(|m| {
            (
                m.topic().to_string(),
                m.time().sec,
                m.data().unwrap().to_vec(),
                m.datatype().to_string(),
            )
        })
        .collect();
    assert_eq!(
        messages,
        vec![
            ("/a".to_string(), 1, b"a1".to_vec(), "test/A".to_string()),
            ("/b".to_string(), 2, b"b2".to_vec(), "test/B".to_string()),
            ("/a".to_string(), 3, b"a3".to_vec(), "test/A".to_string()),
        ]
    );
}

#[test]
fn legacy_bag_topic_filter_and_bounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy2.bag");
    std::fs::write(&path, build_legacy_bag()).unwrap();

    let bag = Bag::open(&path, BagMode::Read).unwrap();
    let only_a = View::with_query(&bag, Query::topics(["/a"])).unwrap();
    let times: Vec<u32> = only_a.iter().map(|m| m.time().sec).collect();
    assert_eq!(times, vec![1, 3]);

    let md5s: Vec<String> = only_a
        .connections()
        .iter()
        .map(|c| c.md5sum.clone())
        .collect();
    assert_eq!(md5s, vec!["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()]);

    // Legacy time bounds come from the index entries themselves.
    let all = View::new(&bag).unwrap();
    assert_eq!(all.begin_time(), Some(Time::from_sec(1)));
    assert_eq!(all.end_time(), Some(Time::from_sec(3)));
}

#[test]
fn legacy_bag_cannot_be_appended() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("legacy3.bag");
    std::fs::write(&path, build_legacy_bag()).unwrap();

    let err = Bag::open(&path, BagMode::Append).unwrap_err();
    assert!(matches!(err, baghouse_core::Error::Format(_)));
}
