// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;

use crate::environment::{
    AppendEnv, CommentEnv, EnvOp, EnvironmentDescriptor, PrependEnv, PriorityEnv, SetEnv,
    generate_startup_script, get_priority,
};

fn composed() -> EnvironmentDescriptor {
    let mut env = EnvironmentDescriptor::new();
    env.search_paths.insert(
        "PATH".to_string(),
        vec!["/store/aa/bin".to_string(), "/store/bb/bin".to_string()],
    );
    env
}

#[test]
fn test_generate_startup_script_basic() {
    let mut env = composed();
    env.apply_ops(&[
        EnvOp::Comment(CommentEnv {
            comment: "Example environment".to_string(),
        }),
        EnvOp::Set(SetEnv {
            set: "FOO".to_string(),
            value: "bar".to_string(),
        }),
        EnvOp::Prepend(PrependEnv {
            prepend: "PATH".to_string(),
            value: "/opt/tools/bin".to_string(),
            separator: None,
        }),
        EnvOp::Append(AppendEnv {
            append: "LD_LIBRARY_PATH".to_string(),
            value: "/opt/tools/lib".to_string(),
            separator: Some(":".to_string()),
        }),
    ]);

    let script = generate_startup_script(&env);

    assert!(script.starts_with("#!/bin/sh\n"));
    assert!(script.contains("# Example environment"));
    assert!(script.contains("export FOO=\"bar\""));
    assert!(script.contains("export PATH=\"/opt/tools/bin:/store/aa/bin:/store/bb/bin\""));
    assert!(script.contains("export LD_LIBRARY_PATH=\"/opt/tools/lib\""));
    // Isolated: host values are never referenced.
    assert!(!script.contains("${"));
}

#[test]
fn test_escape_and_priority_defaults() {
    let ops = vec![
        EnvOp::Set(SetEnv {
            set: "SPECIAL".to_string(),
            value: "value with $dollar and \"quotes\"".to_string(),
        }),
        EnvOp::Priority(PriorityEnv { priority: 10 }),
    ];
    let mut env = EnvironmentDescriptor::new();
    env.apply_ops(&ops);

    let script = generate_startup_script(&env);
    assert!(script.contains("export SPECIAL=\"value with \\$dollar and \\\"quotes\\\"\""));

    assert_eq!(get_priority(&ops), 10);
    assert_eq!(get_priority(&[]), 50);
}

#[test]
fn test_set_replaces_search_path() {
    let mut env = composed();
    env.apply_ops(&[EnvOp::Set(SetEnv {
        set: "PATH".to_string(),
        value: "/usr/bin".to_string(),
    })]);
    assert!(!env.search_paths.contains_key("PATH"));
    assert_eq!(env.get("PATH").as_deref(), Some("/usr/bin"));
}

#[rstest]
#[case(true, "x;a")]
#[case(false, "a;x")]
fn test_custom_separator(#[case] prepend: bool, #[case] expected: &str) {
    let mut env = EnvironmentDescriptor::new();
    env.variables.insert("LIST".to_string(), "a".to_string());
    let op = if prepend {
        EnvOp::Prepend(PrependEnv {
            prepend: "LIST".to_string(),
            value: "x".to_string(),
            separator: Some(";".to_string()),
        })
    } else {
        EnvOp::Append(AppendEnv {
            append: "LIST".to_string(),
            value: "x".to_string(),
            separator: Some(";".to_string()),
        })
    };
    env.apply_ops(&[op]);
    assert_eq!(env.get("LIST").as_deref(), Some(expected));
}

#[test]
fn test_ops_parse_from_yaml() {
    let yaml = r#"
- set: FOO
  value: bar
- prepend: PATH
  value: /opt/bin
- append: PYTHONPATH
  value: /opt/lib/python
  separator: ":"
- comment: hello
- priority: 20
"#;
    let ops: Vec<EnvOp> = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(ops.len(), 5);
    assert!(matches!(&ops[0], EnvOp::Set(s) if s.set == "FOO"));
    assert!(matches!(&ops[1], EnvOp::Prepend(p) if p.separator.is_none()));
    assert!(matches!(&ops[2], EnvOp::Append(a) if a.separator.as_deref() == Some(":")));
    assert!(matches!(&ops[3], EnvOp::Comment(_)));
    assert_eq!(get_priority(&ops), 20);
}
