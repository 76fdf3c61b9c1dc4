use buffait::domain::model::{Confidence, Finding, FindingKind, Severity};
use buffait::{analyze_unit, AnalysisOptions};

fn findings(src: &str) -> Vec<Finding> {
    analyze_unit("case.c", src, &AnalysisOptions::default())
        .unwrap()
        .findings
}

fn lines(found: &[Finding]) -> Vec<u32> {
    found.iter().map(|f| f.line).collect()
}

#[test]
fn test_multi_dimensional_array_checks_each_dimension() {
    let src = "void f(void) {\n  int m[3][4];\n  m[2][3] = 0;\n  m[3][0] = 0;\n  m[1][4] = 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![4, 5], "{:#?}", found);
    assert!(found.iter().all(|f| f.off_by_one));
    assert!(found.iter().all(|f| f.kind == FindingKind::OutOfBoundsWrite));
}

#[test]
fn test_pointer_offsets_keep_the_base_buffer() {
    let src = "void f(void) {\n  char b[8];\n  char *p = b + 4;\n  p[3] = 0;\n  p[4] = 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![5], "{:#?}", found);
    assert_eq!(found[0].buffer, "b");
    assert!(found[0].off_by_one);
}

#[test]
fn test_read_before_the_start() {
    let src = "int f(void) {\n  int a[4];\n  a[0] = 1;\n  return a[-1];\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![4], "{:#?}", found);
    assert_eq!(found[0].kind, FindingKind::OutOfBoundsRead);
    assert!(!found[0].off_by_one);
}

#[test]
fn test_realloc_resizes_the_buffer() {
    let src = "void f(void) {\n  char *p = malloc(4);\n  p = realloc(p, 8);\n  p[7] = 0;\n  p[8] = 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![5], "{:#?}", found);
    assert_eq!(found[0].size, "8");
}

#[test]
fn test_fgets_count_against_destination() {
    let src = "void f(void) {\n  char line[16];\n  fgets(line, sizeof(line), stdin);\n  fgets(line, 32, stdin);\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![4], "{:#?}", found);
    assert_eq!(found[0].kind, FindingKind::LibraryCallOverflow);
    assert_eq!(found[0].buffer, "line");
}

#[test]
fn test_memcpy_and_gets() {
    let src = "void f(void) {\n  char a[8];\n  char b[4];\n  memcpy(a, b, 4);\n  memcpy(a, b, 6);\n  gets(a);\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![5, 6], "{:#?}", found);
    assert_eq!(found[0].kind, FindingKind::LibraryCallOverflow);
    assert_eq!(found[0].buffer, "b");
    assert_eq!(found[1].kind, FindingKind::UnboundedCopy);
    assert_eq!(found[1].severity, Severity::Critical);
}

#[test]
fn test_strcpy_from_command_line() {
    let src = "int main(int argc, char **argv) {\n  char name[32];\n  if (argc < 2)\n    return 1;\n  strcpy(name, argv[1]);\n  return 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![5], "{:#?}", found);
    assert_eq!(found[0].kind, FindingKind::UnboundedCopy);
}

#[test]
fn test_tainted_index_is_a_possible_write() {
    let src = "void f(void) {\n  char b[8];\n  int i = atoi(getenv(\"I\"));\n  b[i] = 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![4], "{:#?}", found);
    assert_eq!(found[0].confidence, Confidence::Possible);

    let quiet = AnalysisOptions {
        report_possible: false,
        ..AnalysisOptions::default()
    };
    let report = analyze_unit("case.c", src, &quiet).unwrap();
    assert!(report.findings.is_empty(), "{:#?}", report.findings);
}

#[test]
fn test_lexer_error_fails_the_unit() {
    let err = analyze_unit("bad.c", "int f(void) { return 0; /* open", &AnalysisOptions::default()).unwrap_err();
    assert!(err.to_string().contains("bad.c"));
}

#[test]
fn test_inclusive_loop_over_parameter_sized_heap_buffer() {
    let src = "void f(int n) {\n  char *p = malloc(n);\n  int i;\n  for (i = 0; i <= n; i++)\n    p[i] = 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![5], "{:#?}", found);
    assert_eq!(found[0].kind, FindingKind::OutOfBoundsWrite);
    assert_eq!(found[0].confidence, Confidence::Definite);
    assert!(found[0].off_by_one);
    assert_eq!(found[0].size, "n");
    assert!(found[0].message.contains("i <= n"), "{}", found[0].message);

    let exclusive = src.replace("i <= n", "i < n");
    assert!(findings(&exclusive).is_empty());
}

#[test]
fn test_inclusive_loop_over_input_sized_heap_buffer() {
    let src = "void f(void) {\n  int n = atoi(getenv(\"N\"));\n  char *p = malloc(n);\n  int i;\n  for (i = 0; i <= n; i++)\n    p[i] = 0;\n}\n";
    let found = findings(src);
    assert_eq!(lines(&found), vec![3, 6], "{:#?}", found);
    assert_eq!(found[0].kind, FindingKind::UncheckedAllocationSize);
    assert_eq!(found[1].kind, FindingKind::OutOfBoundsWrite);
    assert_eq!(found[1].confidence, Confidence::Definite);
    assert_eq!(found[1].severity, Severity::Critical);
    assert!(found[1].off_by_one);
}

#[test]
fn test_deeply_nested_expression_is_skipped_not_fatal() {
    let deep = format!("{}1{}", "(".repeat(250), ")".repeat(250));
    let src = format!("void f(void) {{\n  int x = {};\n  char b[2];\n  b[2] = 0;\n}}\n", deep);
    let report = analyze_unit("deep.c", &src, &AnalysisOptions::default()).unwrap();
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].line, 2);
    assert_eq!(lines(&report.findings), vec![4]);
}

#[test]
fn test_oversized_array_length_is_not_a_zero_sized_buffer() {
    let src = "void f(void) {\n  char b[99999999999999999999];\n  b[0] = 0;\n}\n";
    assert!(findings(src).is_empty());
}
