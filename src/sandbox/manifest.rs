//! Self-contained runner setup written into every sandbox, so the suite
//! never depends on the host project's configuration.

use serde_json::json;
use std::path::PathBuf;

pub const PACKAGE_JSON: &str = "package.json";
pub const JEST_CONFIG: &str = "jest.config.js";
pub const TSCONFIG: &str = "tsconfig.json";

const JEST_CONFIG_JS: &str = r#"/** Generated by mend. */
module.exports = {
  testEnvironment: 'node',
  roots: ['<rootDir>'],
  testMatch: ['**/*.test.[jt]s?(x)', '**/*.test.[mc]js'],
  transform: {
    '^.+\\.[tj]sx?$': ['ts-jest', { tsconfig: '<rootDir>/tsconfig.json' }],
    '^.+\\.[mc]js$': ['ts-jest', { tsconfig: '<rootDir>/tsconfig.json' }],
  },
  moduleFileExtensions: ['ts', 'tsx', 'js', 'jsx', 'mjs', 'cjs', 'json'],
  testPathIgnorePatterns: ['/node_modules/'],
  clearMocks: true,
  testTimeout: 10000,
};
"#;

/// Minimal dev-dependency set for Jest + ts-jest.
pub fn package_json() -> String {
    let manifest = json!({
        "name": "mend-sandbox",
        "version": "0.0.0",
        "private": true,
        "scripts": { "test": "jest" },
        "devDependencies": {
            "jest": "^29.7.0",
            "ts-jest": "^29.1.2",
            "typescript": "^5.4.5",
            "@types/jest": "^29.5.12",
            "@types/node": "^20.12.7"
        }
    });
    format!("{:#}\n", manifest)
}

pub fn tsconfig_json() -> String {
    let config = json!({
        "compilerOptions": {
            "target": "ES2020",
            "module": "commonjs",
            "allowJs": true,
            "esModuleInterop": true,
            "jsx": "react-jsx",
            "skipLibCheck": true,
            "strict": false,
            "types": ["jest", "node"]
        }
    });
    format!("{:#}\n", config)
}

/// Files to materialize next to the source and test.
pub fn runner_files() -> Vec<(PathBuf, String)> {
    vec![
        (PathBuf::from(PACKAGE_JSON), package_json()),
        (PathBuf::from(JEST_CONFIG), JEST_CONFIG_JS.to_string()),
        (PathBuf::from(TSCONFIG), tsconfig_json()),
    ]
}
