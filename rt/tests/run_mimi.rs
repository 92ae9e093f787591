// run_mimi.rs - end-to-end: C source through the compiler, loader and
// execution engine.
//
// Each case compiles with mimic-cc into a temp directory, mounts that
// directory as the machine's filesystem, loads the image and runs it to
// completion.

use std::fs;
use std::path::{Path, PathBuf};

use mimic_rt::fs::HostFs;
use mimic_rt::Machine;

const FUEL: u64 = 10_000_000;

fn build(dir: &Path, sources: &[(&str, &str)]) -> PathBuf {
    let mut paths = Vec::new();
    for (name, text) in sources {
        let p = dir.join(name);
        fs::write(&p, text).unwrap();
        paths.push(p);
    }
    let out = dir.join("prog.mimi");
    mimic_cc::compile_and_link(&paths, &out).expect("compile and link");
    out
}

fn run_sources(sources: &[(&str, &str)]) -> (i32, String) {
    let dir = tempfile::tempdir().unwrap();
    build(dir.path(), sources);

    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));
    machine.load_task("prog.mimi", 10).expect("load");
    let code = machine.run(FUEL).expect("run");
    let out = String::from_utf8_lossy(&machine.take_output()).into_owned();
    (code, out)
}

fn run_c(src: &str) -> i32 {
    run_sources(&[("main.c", src)]).0
}

// ==========================================================================
// The concrete end-to-end scenarios
// ==========================================================================

#[test]
fn return_42() {
    assert_eq!(run_c("int main() { return 42; }"), 42);
}

#[test]
fn for_loop_sums_to_45() {
    assert_eq!(
        run_c("int main() { int s = 0; int i; for (i = 0; i < 10; i++) s = s + i; return s; }"),
        45
    );
}

#[test]
fn cross_function_call_returns_42() {
    let (code, _) = run_sources(&[(
        "main.c",
        "int add(int a, int b) { return a + b; }\n\
         int main() { return add(10, 32); }",
    )]);
    assert_eq!(code, 42);
}

#[test]
fn two_unit_program_links_and_runs() {
    let (code, _) = run_sources(&[
        ("lib.c", "int triple(int x) { return x * 3; }"),
        (
            "main.c",
            "int triple(int x);\nint main() { return triple(14); }",
        ),
    ]);
    assert_eq!(code, 42);
}

// ==========================================================================
// Expression semantics (precedence, associativity, operators)
// ==========================================================================

#[test]
fn multiplication_binds_tighter_than_addition() {
    assert_eq!(run_c("int main() { return 2 + 3 * 4; }"), 14);
    assert_eq!(run_c("int main() { return (2 + 3) * 4; }"), 20);
}

#[test]
fn assignment_is_right_associative() {
    assert_eq!(
        run_c("int main() { int a; int b; int c; a = b = c = 7; return a + b + c; }"),
        21
    );
}

#[test]
fn subtraction_respects_operand_order() {
    assert_eq!(run_c("int main() { return 50 - 8; }"), 42);
    assert_eq!(run_c("int main() { int a = 3; return 1 - a; }"), -2);
}

#[test]
fn division_and_modulo_through_the_trampoline() {
    assert_eq!(run_c("int main() { return 85 / 2; }"), 42);
    assert_eq!(run_c("int main() { return 142 % 100; }"), 42);
    // Truncating signed division.
    assert_eq!(run_c("int main() { return -7 / 2; }"), -3);
}

#[test]
fn shifts_and_bitwise_ops() {
    assert_eq!(run_c("int main() { return 1 << 5; }"), 32);
    assert_eq!(run_c("int main() { return 168 >> 2; }"), 42);
    assert_eq!(run_c("int main() { return (0xF0 & 0x3C) | (1 ^ 3); }"), 0x32);
}

#[test]
fn comparisons_yield_zero_or_one() {
    assert_eq!(run_c("int main() { return (1 < 2) + (2 <= 2) + (3 > 2) + (2 >= 9); }"), 3);
    assert_eq!(run_c("int main() { return (4 == 4) + (4 != 4); }"), 1);
    // Signed comparison.
    assert_eq!(run_c("int main() { int a = -5; return a < 3; }"), 1);
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(run_c("int main() { return 1 && 2; }"), 1);
    assert_eq!(run_c("int main() { return 0 || 3; }"), 1);
    // The right side must not run; its assignment would be visible.
    assert_eq!(
        run_c("int main() { int z = 0; int t = 0; z && (t = 5); return t; }"),
        0
    );
    assert_eq!(
        run_c("int main() { int t = 0; 1 || (t = 5); return t; }"),
        0
    );
}

#[test]
fn ternary_and_unary_operators() {
    assert_eq!(run_c("int main() { return 1 ? 42 : 7; }"), 42);
    assert_eq!(run_c("int main() { return 0 ? 7 : 42; }"), 42);
    assert_eq!(run_c("int main() { return !0 + !5; }"), 1);
    assert_eq!(run_c("int main() { return -(-42); }"), 42);
    assert_eq!(run_c("int main() { return (~0) & 0xFF; }"), 255);
}

#[test]
fn compound_assignment_and_increments() {
    assert_eq!(run_c("int main() { int x = 6; x += 7; x *= 3; x -= 1; return x; }"), 38);
    assert_eq!(run_c("int main() { int x = 84; x /= 2; return x; }"), 42);
    assert_eq!(
        run_c("int main() { int i = 5; int a = i++; int b = ++i; return a * 10 + b; }"),
        57
    );
    assert_eq!(run_c("int main() { int i = 5; return i--; }"), 5);
}

#[test]
fn comma_evaluates_left_to_right() {
    assert_eq!(run_c("int main() { int a = 0; return (a = 5, a + 1); }"), 6);
}

#[test]
fn sizeof_known_types() {
    assert_eq!(run_c("int main() { return sizeof(int) + sizeof(char) + sizeof(int*); }"), 9);
}

#[test]
fn wide_immediates_synthesise_correctly() {
    assert_eq!(run_c("int main() { return 0x12345 / 0x1000; }"), 0x12);
    assert_eq!(run_c("int main() { return 100000 > 99999; }"), 1);
    assert_eq!(run_c("int main() { int x = -1000; return x + 1042; }"), 42);
}

#[test]
fn hex_and_octal_and_char_literals() {
    assert_eq!(run_c("int main() { return 0x2A; }"), 42);
    assert_eq!(run_c("int main() { return 052; }"), 42);
    assert_eq!(run_c("int main() { return '*'; }"), 42);
}

// ==========================================================================
// Statements and control flow
// ==========================================================================

#[test]
fn if_else_chains() {
    let src = "int classify(int x) {\n\
                   if (x < 0) return 1;\n\
                   else if (x == 0) return 2;\n\
                   else return 3;\n\
               }\n\
               int main() { return classify(-4) * 100 + classify(0) * 10 + classify(9); }";
    assert_eq!(run_c(src), 123);
}

#[test]
fn while_and_do_while() {
    assert_eq!(
        run_c("int main() { int n = 0; while (n < 42) n = n + 7; return n; }"),
        42
    );
    assert_eq!(
        run_c("int main() { int n = 0; do { n++; } while (n < 5); return n; }"),
        5
    );
}

#[test]
fn break_and_continue() {
    let src = "int main() {\n\
                   int s = 0; int i;\n\
                   for (i = 0; i < 100; i++) {\n\
                       if (i % 2) continue;\n\
                       if (i >= 10) break;\n\
                       s += i;\n\
                   }\n\
                   return s;\n\
               }";
    // 0 + 2 + 4 + 6 + 8
    assert_eq!(run_c(src), 20);
}

#[test]
fn nested_loops() {
    let src = "int main() {\n\
                   int s = 0; int i; int j;\n\
                   for (i = 0; i < 5; i++)\n\
                       for (j = 0; j < 5; j++)\n\
                           if (i == j) s += i;\n\
                   return s;\n\
               }";
    assert_eq!(run_c(src), 10);
}

#[test]
fn recursion_works_through_bl() {
    let src = "int fact(int n) { if (n < 2) return 1; return n * fact(n - 1); }\n\
               int main() { return fact(5); }";
    assert_eq!(run_c(src), 120);
}

#[test]
fn four_arguments_arrive_in_order() {
    let src = "int pack(int a, int b, int c, int d) { return a * 1000 + b * 100 + c * 10 + d; }\n\
               int main() { return pack(1, 2, 3, 4) == 1234; }";
    assert_eq!(run_c(src), 1);
}

// ==========================================================================
// Memory: locals, pointers, arrays, globals
// ==========================================================================

#[test]
fn pointers_and_address_of() {
    let src = "int main() { int x = 1; int *p; p = &x; *p = 7; return x + *p; }";
    assert_eq!(run_c(src), 14);
}

#[test]
fn local_arrays_index_and_sum() {
    let src = "int main() {\n\
                   int a[5]; int i; int s = 0;\n\
                   for (i = 0; i < 5; i++) a[i] = i * i;\n\
                   for (i = 0; i < 5; i++) s += a[i];\n\
                   return s;\n\
               }";
    assert_eq!(run_c(src), 30);
}

#[test]
fn char_arrays_use_byte_accesses() {
    let src = "int main() { char b[4]; b[0] = 'a'; b[1] = 'b'; return b[0] + b[1]; }";
    assert_eq!(run_c(src), 195);
}

#[test]
fn globals_data_and_bss() {
    let src = "int start = 40;\n\
               int counter;\n\
               int main() { counter = start + 2; return counter; }";
    assert_eq!(run_c(src), 42);
}

#[test]
fn global_bss_array_is_zeroed() {
    let src = "int table[8];\n\
               int main() { int i; int s = 0; for (i = 0; i < 8; i++) s += table[i]; return s; }";
    assert_eq!(run_c(src), 0);
}

#[test]
fn string_literals_deref_through_pointers() {
    let src = "int main() { char *s = \"*K\"; return s[0]; }";
    assert_eq!(run_c(src), 42);
}

#[test]
fn global_string_pointer_reads_back() {
    let src = "char *greeting = \"G\";\n\
               int main() { return greeting[0]; }";
    assert_eq!(run_c(src), b'G' as i32);
}

#[test]
fn pointer_arithmetic_scales_by_element() {
    let src = "int main() { int a[3]; int *p; a[0]=1; a[1]=2; a[2]=39; p = a; return *(p + 2) + *p + *(p + 1); }";
    assert_eq!(run_c(src), 42);
}

#[test]
fn typedef_and_enum_constants_run() {
    let src = "typedef int word;\n\
               enum { BASE = 40, STEP = 2 };\n\
               word main() { word x = BASE; return x + STEP; }";
    assert_eq!(run_c(src), 42);
}

#[test]
fn quoted_include_compiles_in() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("lib.h"), "int double_it(int x) { return x * 2; }\n").unwrap();
    fs::write(
        dir.path().join("main.c"),
        "#include \"lib.h\"\nint main() { return double_it(21); }",
    )
    .unwrap();
    let out = dir.path().join("prog.mimi");
    mimic_cc::compile_and_link(&[dir.path().join("main.c")], &out).unwrap();

    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));
    machine.load_task("prog.mimi", 10).unwrap();
    assert_eq!(machine.run(FUEL).unwrap(), 42);
}

// ==========================================================================
// Syscalls
// ==========================================================================

#[test]
fn console_output_is_captured() {
    let (code, out) = run_sources(&[(
        "main.c",
        "int main() { puts(\"hello \"); putchar('m'); putchar('c'); return 0; }",
    )]);
    assert_eq!(code, 0);
    assert_eq!(out, "hello mc");
}

#[test]
fn getchar_reads_pushed_input() {
    let dir = tempfile::tempdir().unwrap();
    build(
        dir.path(),
        &[("main.c", "int main() { return getchar(); }")],
    );
    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));
    machine.push_input(b"*");
    machine.load_task("prog.mimi", 10).unwrap();
    assert_eq!(machine.run(FUEL).unwrap(), 42);
}

#[test]
fn malloc_free_roundtrip() {
    let src = "int main() {\n\
                   int *p; int *q;\n\
                   p = malloc(64);\n\
                   if (p == 0) return 1;\n\
                   *p = 21;\n\
                   q = malloc(64);\n\
                   if (q == 0) return 2;\n\
                   *q = 21;\n\
                   int r = *p + *q;\n\
                   free(p);\n\
                   free(q);\n\
                   return r;\n\
               }";
    assert_eq!(run_c(src), 42);
}

#[test]
fn realloc_preserves_contents() {
    let src = "int main() {\n\
                   int *p = malloc(8);\n\
                   *p = 42;\n\
                   p = realloc(p, 256);\n\
                   if (p == 0) return 1;\n\
                   return *p;\n\
               }";
    assert_eq!(run_c(src), 42);
}

#[test]
fn exit_syscall_sets_the_code() {
    assert_eq!(run_c("int main() { exit(42); return 7; }"), 42);
}

#[test]
fn yield_and_sleep_come_back() {
    assert_eq!(run_c("int main() { yield(); sleep_ms(2); return 42; }"), 42);
}

#[test]
fn unknown_extern_fails_the_link() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.c"), "int main() { return mystery(); }").unwrap();
    let out = dir.path().join("prog.mimi");
    let err = mimic_cc::compile_and_link(&[dir.path().join("main.c")], &out).unwrap_err();
    assert!(err.diags.iter().any(|d| d.msg.contains("mystery")));
}

#[test]
fn file_io_syscalls_reach_the_host_fs() {
    let src = r#"
        int main() {
            int fd = open("out.txt", 2 | 8);
            if (fd < 0) return 1;
            char buf[4];
            buf[0] = 'o'; buf[1] = 'k'; buf[2] = '\n';
            write(fd, buf, 3);
            close(fd);

            fd = open("out.txt", 1);
            if (fd < 0) return 2;
            char back[4];
            int n = read(fd, back, 3);
            close(fd);
            if (n != 3) return 3;
            return back[0] == 'o' && back[1] == 'k';
        }
    "#;
    let dir = tempfile::tempdir().unwrap();
    build(dir.path(), &[("main.c", src)]);
    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));
    machine.load_task("prog.mimi", 10).unwrap();
    assert_eq!(machine.run(FUEL).unwrap(), 1);
    assert_eq!(fs::read(dir.path().join("out.txt")).unwrap(), b"ok\n");
}

// ==========================================================================
// Task accounting
// ==========================================================================

#[test]
fn task_memory_is_reclaimed_after_exit() {
    let dir = tempfile::tempdir().unwrap();
    build(dir.path(), &[("main.c", "int main() { malloc(1000); malloc(2000); return 0; }")]);
    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));

    let free_before = {
        let pool = machine.user_pool.lock().unwrap();
        pool.free_bytes()
    };
    machine.load_task("prog.mimi", 10).unwrap();
    machine.run(FUEL).unwrap();
    // Exit frees the image block and both mallocs; coalescing restores
    // the arena.
    let mut pool = machine.user_pool.lock().unwrap();
    pool.coalesce();
    assert_eq!(pool.free_bytes(), free_before);
    assert_eq!(pool.largest_free(), free_before);
}

#[test]
fn two_tasks_run_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.c"), "int main() { yield(); return 7; }").unwrap();
    fs::write(dir.path().join("b.c"), "int main() { return 9; }").unwrap();
    mimic_cc::compile_and_link(&[dir.path().join("a.c")], &dir.path().join("a.mimi")).unwrap();
    mimic_cc::compile_and_link(&[dir.path().join("b.c")], &dir.path().join("b.mimi")).unwrap();

    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));
    machine.load_task("a.mimi", 10).unwrap();
    machine.load_task("b.mimi", 20).unwrap();
    machine.run(FUEL).unwrap();
    assert!(!machine.tasks.user_tasks_alive());
}

#[test]
fn runaway_program_runs_out_of_fuel() {
    let dir = tempfile::tempdir().unwrap();
    build(dir.path(), &[("main.c", "int main() { while (1) {} return 0; }")]);
    let mut machine = Machine::new(Box::new(HostFs::new(dir.path())));
    machine.load_task("prog.mimi", 10).unwrap();
    assert!(machine.run(100_000).is_err());
}
