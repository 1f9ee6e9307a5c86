//! Human-readable rendering of DNS questions and answers for the log

use hickory_proto::op::Query;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tracing::info;

/// Canonical type name: `Type<mnemonic>` for known types, the numeric code otherwise
fn canonical_type_name(record_type: RecordType) -> String {
    match record_type {
        RecordType::Unknown(code) => code.to_string(),
        other => format!("Type{}", other),
    }
}

fn canonical_class_name(class: DNSClass) -> String {
    match class {
        DNSClass::IN => "ClassINET".to_string(),
        DNSClass::CH => "ClassCHAOS".to_string(),
        DNSClass::HS => "ClassHESIOD".to_string(),
        DNSClass::NONE => "ClassNONE".to_string(),
        DNSClass::ANY => "ClassANY".to_string(),
        other => u16::from(other).to_string(),
    }
}

/// Record type for display: `A`, `AAAA`, ... or `unknown (type 65280)`
pub fn format_record_type(record_type: RecordType) -> String {
    let name = canonical_type_name(record_type);
    match name.strip_prefix("Type") {
        Some(mnemonic) if !mnemonic.is_empty() => mnemonic.to_string(),
        _ => format!("unknown (type {})", name),
    }
}

/// `name TYPE CLASS` with the root dot trimmed, e.g. `example.com A INET`
pub fn format_question(query: &Query) -> String {
    let name = query.name().to_string();
    let name = name.strip_suffix('.').unwrap_or(&name);

    let class = canonical_class_name(query.query_class());
    let class = class.strip_prefix("Class").unwrap_or(&class);

    format!("{} {} {}", name, format_record_type(query.query_type()), class)
}

/// Answer body as text, or `None` for record kinds that are not logged
pub fn format_answer(record: &Record) -> Option<String> {
    let content = match record.data()? {
        RData::A(a) => a.0.to_string(),
        RData::AAAA(aaaa) => aaaa.0.to_string(),
        RData::NS(ns) => ns.0.to_string(),
        RData::CNAME(cname) => cname.0.to_string(),
        RData::PTR(ptr) => ptr.0.to_string(),
        RData::SOA(soa) => soa.rname().to_string(),
        RData::MX(mx) => mx.exchange().to_string(),
        RData::SRV(srv) => srv.target().to_string(),
        RData::TXT(txt) => txt
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        RData::Unknown { code, .. } => canonical_type_name(*code),
        _ => return None,
    };
    Some(content)
}

/// One `exchanged <domain> <TYPE> <content>` line per loggable answer, in order
pub fn render_dns_answers(domain: &str, answers: &[Record]) -> Vec<String> {
    answers
        .iter()
        .filter_map(|record| {
            let content = format_answer(record)?;
            Some(format!(
                "exchanged {} {} {}",
                domain,
                format_record_type(record.record_type()),
                content
            ))
        })
        .collect()
}

pub fn log_dns_answers(domain: &str, answers: &[Record]) {
    for line in render_dns_answers(domain, answers) {
        info!("[dns] {}", line);
    }
}
