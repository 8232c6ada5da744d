//! Starter content for documents created through a recognised extension.

use docsync_common::name::default_content_extension;

const CPP_TEMPLATE: &str = r#"#include <bits/stdc++.h>

using namespace std;

int main() {
    cin.tie(0)->sync_with_stdio(0);

}
"#;

const JAVA_TEMPLATE: &str = r#"import java.io.*;
import java.util.*;

public class Main {
    public static void main(String[] args) throws IOException {
        BufferedReader br = new BufferedReader(new InputStreamReader(System.in));

    }
}
"#;

const PY_TEMPLATE: &str = r#"import sys

input = sys.stdin.readline


def main():
    pass


main()
"#;

/// Template for a document name, keyed by its second `.` component.
pub fn default_content(name: &str) -> Option<&'static str> {
    match default_content_extension(name)? {
        "cpp" => Some(CPP_TEMPLATE),
        "java" => Some(JAVA_TEMPLATE),
        "py" => Some(PY_TEMPLATE),
        _ => None,
    }
}
