//! DNS message parsing/encoding for the bogus-DNS responder, using
//! `hickory_proto`'s wire types (grounded on the `RData::A` / `Message`
//! usage in `examples/ferrous-networking-Ferrous-DNS`'s DNS server and
//! response parser) instead of hand-rolled byte layout.

use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata::A, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use super::BogusTable;
use crate::error::Error;

/// Decodes `buf` as a DNS query, resolves it against `table`, and returns the
/// wire-encoded response. Only `QTYPE=A` is answered with a real record;
/// everything else gets an empty, still-`NoError` response.
pub async fn handle_query(table: &BogusTable, buf: &[u8], dns_ttl: Duration) -> Result<Vec<u8>, Error> {
    let request = Message::from_bytes(buf).map_err(|e| Error::BogusDns(format!("malformed query: {e}")))?;

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(ResponseCode::NoError);
    response.set_recursion_available(false);

    for query in request.queries() {
        response.add_query(query.clone());

        if query.query_type() != RecordType::A {
            continue;
        }
        let raw_name = query.name().to_utf8();
        let name = raw_name.trim_end_matches('.');
        match table.get_ip(name).await {
            Ok(ip) => {
                let record_name =
                    Name::from_utf8(raw_name.clone()).unwrap_or_else(|_| query.name().clone());
                response.add_answer(Record::from_rdata(
                    record_name,
                    dns_ttl.as_secs() as u32,
                    RData::A(A(ip)),
                ));
            }
            Err(e) => {
                log::debug!("bogusdns: assignment failed for {name:?}: {e}");
                // Empty answer, no error — per spec §4.5, SERVFAIL is
                // avoided so resolvers don't cache a failure.
            }
        }
    }

    response
        .to_bytes()
        .map_err(|e| Error::BogusDns(format!("failed to encode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use std::net::Ipv4Addr;
    use std::time::Duration as StdDuration;

    fn build_query(name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_utf8(name).unwrap(), rtype));
        msg.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn answers_a_query_with_synthesized_ip() {
        let (table, _serializer) =
            BogusTable::spawn("10.24.0.0".parse::<Ipv4Addr>().unwrap(), StdDuration::from_secs(60));
        let query = build_query("foo.test.", RecordType::A);
        let reply = handle_query(&table, &query, StdDuration::from_secs(60)).await.unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NoError);
        assert_eq!(parsed.answers().len(), 1);
    }

    #[tokio::test]
    async fn non_a_query_gets_empty_noerror_response() {
        let (table, _serializer) =
            BogusTable::spawn("10.24.0.0".parse::<Ipv4Addr>().unwrap(), StdDuration::from_secs(60));
        let query = build_query("foo.test.", RecordType::AAAA);
        let reply = handle_query(&table, &query, StdDuration::from_secs(60)).await.unwrap();
        let parsed = Message::from_bytes(&reply).unwrap();
        assert_eq!(parsed.response_code(), ResponseCode::NoError);
        assert!(parsed.answers().is_empty());
    }
}
