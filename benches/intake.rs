//! Performance benchmarks for a3s-warden
//!
//! Run with: cargo bench

use a3s_warden::{
    sanitize_filename, sanitize_html, sanitize_markdown, Executable, FileValidator, MonitorConfig,
    Plugin, PluginInput, PluginSandbox, SandboxConfig, SandboxMode, SecurityEvent,
    SecurityEventMonitor, SecurityEventType, Severity, ValidatorConfig,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{Map, Value};
use std::io::Write;
use zip::write::SimpleFileOptions;

fn bench_sniff(c: &mut Criterion) {
    let pdf = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n".to_vec();
    let text = b"Quarterly numbers look fine, nothing to report.\n".to_vec();

    c.bench_function("sniff pdf", |b| {
        b.iter(|| a3s_warden::sniff::detect(&pdf));
    });

    c.bench_function("sniff text", |b| {
        b.iter(|| a3s_warden::sniff::detect(&text));
    });
}

fn bench_validate(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let validator = FileValidator::new(ValidatorConfig::default()).unwrap();

    let text = dir.path().join("notes.txt");
    std::fs::write(&text, "plain words only\n".repeat(4096)).unwrap();

    let archive = dir.path().join("bundle.zip");
    let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for i in 0..200 {
        writer.start_file(format!("docs/page-{}.md", i), options).unwrap();
        writer.write_all(b"# Page\n\nSome content.\n").unwrap();
    }
    writer.finish().unwrap();

    c.bench_function("validate text (64KiB)", |b| {
        b.iter(|| validator.validate(&text));
    });

    c.bench_function("validate zip (200 entries)", |b| {
        b.iter(|| validator.validate(&archive));
    });
}

fn bench_sanitize(c: &mut Criterion) {
    let markdown = "# Title\n\n[ok](https://example.com) [bad](javascript:alert(1)) <script>x()</script>\n"
        .repeat(100);
    let html = "<p class=\"x\" onclick=\"y()\">text <a href=\"javascript:z()\">link</a><script>s()</script></p>"
        .repeat(100);

    c.bench_function("sanitize_markdown (100 lines)", |b| {
        b.iter(|| sanitize_markdown(&markdown));
    });

    c.bench_function("sanitize_html (100 fragments)", |b| {
        b.iter(|| sanitize_html(&html));
    });

    c.bench_function("sanitize_filename", |b| {
        b.iter(|| sanitize_filename("../../uploads/CON.quarterly<report>?.pdf"));
    });
}

fn bench_monitor_record(c: &mut Criterion) {
    let monitor = SecurityEventMonitor::new(MonitorConfig::default()).unwrap();

    c.bench_function("monitor record", |b| {
        b.iter(|| {
            monitor.record(SecurityEvent::new(
                SecurityEventType::FileUpload,
                Severity::Low,
                "bench",
                "File accepted",
            ))
        });
    });

    c.bench_function("monitor correlate (full log)", |b| {
        b.iter(|| monitor.correlate());
    });
}

struct Identity;

impl Executable for Identity {
    fn call(&self, input: &PluginInput) -> Result<Value, String> {
        Ok(Value::Array(input.args.clone()))
    }
}

fn bench_trusted_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sandbox = PluginSandbox::new(SandboxConfig {
        mode: SandboxMode::Trusted,
        ..Default::default()
    })
    .unwrap();
    let plugin = Plugin::callable(Identity);

    c.bench_function("execute trusted callable", |b| {
        b.to_async(&rt).iter(|| async {
            sandbox
                .execute_default(&plugin, vec![serde_json::json!(1)], Map::new())
                .await
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_sniff,
    bench_validate,
    bench_sanitize,
    bench_monitor_record,
    bench_trusted_execute,
);
criterion_main!(benches);
