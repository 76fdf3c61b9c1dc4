use buffait::domain::model::{Confidence, FindingKind};
use buffait::{analyze_unit, AnalysisOptions};

const FIXTURE: &str = include_str!("fixtures/paper-example.c");

const FIXED: &str = r#"#include <stdlib.h>
#define BUFF_SIZE 100

int main(int argc, char *argv[])
{
    char buf[BUFF_SIZE], *buf2;
    int n = BUFF_SIZE, i;

    if (argc != 3)
    {
        printf("Usage: prog_name length_of_data data\n");
        exit(-1);
    }

    for (i = 1; i < n; i++)
    {
        buf[i] = 'A';
    }

    buf[n - 1] = '\0';
    n = atoi(argv[1]);
    if (n <= 0 || n > BUFF_SIZE)
        exit(-1);
    buf2 = (char *)malloc(n);

    for (i = 0; i < n; i++)
    {
        buf2[i] = argv[2][i];
    }
    return 0;
}
"#;

#[test]
fn test_fixture_reports_the_four_defects() {
    let report = analyze_unit("paper-example.c", FIXTURE, &AnalysisOptions::default()).unwrap();
    assert_eq!(report.functions_analyzed, 1);

    let summary: Vec<(u32, FindingKind, &str)> = report
        .findings
        .iter()
        .map(|f| (f.line, f.kind, f.buffer.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (17, FindingKind::OutOfBoundsWrite, "buf"),
            (20, FindingKind::OutOfBoundsWrite, "buf"),
            (22, FindingKind::UncheckedAllocationSize, "buf2"),
            (26, FindingKind::OutOfBoundsWrite, "buf2"),
        ],
        "{:#?}",
        report.findings
    );

    let loop_write = &report.findings[0];
    assert_eq!(loop_write.confidence, Confidence::Definite);
    assert!(loop_write.off_by_one);
    assert_eq!(loop_write.size, "100");
    assert!(loop_write.message.contains("i <= n"), "{}", loop_write.message);

    let terminator = &report.findings[1];
    assert_eq!(terminator.confidence, Confidence::Definite);
    assert_eq!(terminator.snippet, "buf[n] = '\\0';");

    let copy_loop = &report.findings[3];
    assert_eq!(copy_loop.confidence, Confidence::Definite);
    assert!(copy_loop.off_by_one);
    assert_eq!(copy_loop.function, "main");
}

#[test]
fn test_fixed_program_is_clean() {
    let report = analyze_unit("fixed.c", FIXED, &AnalysisOptions::default()).unwrap();
    assert!(report.findings.is_empty(), "{:#?}", report.findings);
}

#[test]
fn test_buffer_size_define_from_options_is_overridden_by_file() {
    let mut options = AnalysisOptions::default();
    options.defines.insert("BUFF_SIZE".to_string(), "200".to_string());
    let report = analyze_unit("paper-example.c", FIXTURE, &options).unwrap();
    assert_eq!(report.findings.len(), 4);
    assert_eq!(report.findings[0].size, "100");
}

#[test]
fn test_definite_only_mode_keeps_the_fixture_findings() {
    let options = AnalysisOptions {
        report_possible: false,
        ..AnalysisOptions::default()
    };
    let report = analyze_unit("paper-example.c", FIXTURE, &options).unwrap();
    let writes = report
        .findings
        .iter()
        .filter(|f| f.kind == FindingKind::OutOfBoundsWrite)
        .count();
    assert_eq!(writes, 3);
}
