//! Registered templates and the builtin project layouts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{FlagPredicate, ManifestNode, TemplateManifest};
use crate::errors::TemplateError;

/// Manifests keyed by template id.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    manifests: BTreeMap<String, Arc<TemplateManifest>>,
}

impl TemplateCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog holding the builtin `rest-api` and `worker`
    /// templates.
    #[must_use]
    pub fn builtin() -> Self {
        let mut manifests = BTreeMap::new();
        for manifest in [rest_api(), worker()] {
            manifests.insert(manifest.template_id.clone(), Arc::new(manifest));
        }
        Self { manifests }
    }

    /// Validates and registers a manifest, replacing any with the same id.
    pub fn register(&mut self, manifest: TemplateManifest) -> Result<(), TemplateError> {
        manifest.validate()?;
        tracing::debug!(template_id = %manifest.template_id, "Registered template");
        self.manifests
            .insert(manifest.template_id.clone(), Arc::new(manifest));
        Ok(())
    }

    /// Parses, validates and registers a JSON manifest.
    pub fn register_json(&mut self, json: &str) -> Result<(), TemplateError> {
        self.register(TemplateManifest::from_json(json)?)
    }

    /// Looks up a manifest.
    pub fn get(&self, template_id: &str) -> Result<Arc<TemplateManifest>, TemplateError> {
        self.manifests
            .get(template_id)
            .cloned()
            .ok_or_else(|| TemplateError::UnknownTemplate {
                template_id: template_id.to_string(),
            })
    }

    /// The flag vocabulary of a template.
    pub fn known_flags(&self, template_id: &str) -> Result<BTreeSet<String>, TemplateError> {
        Ok(self.get(template_id)?.known_flags())
    }

    /// Registered template ids.
    #[must_use]
    pub fn template_ids(&self) -> Vec<&str> {
        self.manifests.keys().map(String::as_str).collect()
    }

    /// Number of registered templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

fn flag(name: &str) -> FlagPredicate {
    FlagPredicate::flag(name)
}

fn rest_api() -> TemplateManifest {
    TemplateManifest::new("rest-api")
        .with_description("TypeScript HTTP service")
        .with_flags(["database", "redis", "swagger", "auth", "docker"])
        .with_node(ManifestNode::file("README.md", REST_README))
        .with_node(ManifestNode::file("package.json", REST_PACKAGE_JSON))
        .with_node(ManifestNode::file("tsconfig.json", TSCONFIG))
        .with_node(ManifestNode::file(".env.example", REST_ENV))
        .with_node(ManifestNode::dir(
            "src",
            vec![
                ManifestNode::file("index.ts", REST_INDEX),
                ManifestNode::file("app.ts", REST_APP),
                ManifestNode::file("routes/health.ts", REST_HEALTH),
                ManifestNode::file("db.ts", REST_DB).when(flag("database")),
                ManifestNode::file("cache.ts", REST_CACHE).when(flag("redis")),
                ManifestNode::file("swagger.ts", REST_SWAGGER).when(flag("swagger")),
                ManifestNode::file("middleware/auth.ts", REST_AUTH).when(flag("auth")),
            ],
        ))
        .with_node(ManifestNode::dir(
            "test",
            vec![ManifestNode::file("health.test.ts", REST_HEALTH_TEST)],
        ))
        .with_node(ManifestNode::file("Dockerfile", NODE_DOCKERFILE).when(flag("docker")))
        .with_node(
            ManifestNode::file("docker-compose.yml", REST_COMPOSE).when(FlagPredicate::All(vec![
                flag("docker"),
                FlagPredicate::Any(vec![flag("database"), flag("redis")]),
            ])),
        )
}

fn worker() -> TemplateManifest {
    TemplateManifest::new("worker")
        .with_description("Python background worker")
        .with_flags(["redis", "scheduler", "docker"])
        .with_node(ManifestNode::file("README.md", WORKER_README))
        .with_node(ManifestNode::file("requirements.txt", WORKER_REQUIREMENTS))
        .with_node(ManifestNode::dir(
            "{{service_name}}",
            vec![
                ManifestNode::file("__init__.py", ""),
                ManifestNode::file("config.py", WORKER_CONFIG),
                ManifestNode::file("main.py", WORKER_MAIN),
                ManifestNode::file("tasks.py", WORKER_TASKS),
                ManifestNode::file("schedule.py", WORKER_SCHEDULE).when(flag("scheduler")),
            ],
        ))
        .with_node(ManifestNode::dir(
            "tests",
            vec![ManifestNode::file("test_tasks.py", WORKER_TEST)],
        ))
        .with_node(ManifestNode::file("Dockerfile", PYTHON_DOCKERFILE).when(flag("docker")))
}

const REST_README: &str = r"# {{service_name}}

Owned by {{owner}}. Target environment: {{env}}.

## Features
{{#each flag_list}}
- {{this}}
{{/each}}

## Development

    npm install
    npm run dev
";

const REST_PACKAGE_JSON: &str = r#"{
  "name": "{{service_name}}",
  "version": "0.1.0",
  "private": true,
  "scripts": {
    "build": "tsc",
    "dev": "ts-node src/index.ts",
    "start": "node dist/index.js",
    "test": "jest"
  },
  "dependencies": {
    "express": "^4.19.2"{{#if flags.database}},
    "pg": "^8.11.5"{{/if}}{{#if flags.redis}},
    "redis": "^4.6.13"{{/if}}{{#if flags.swagger}},
    "swagger-ui-express": "^5.0.0"{{/if}}{{#if flags.auth}},
    "jsonwebtoken": "^9.0.2"{{/if}}
  },
  "devDependencies": {
    "@types/express": "^4.17.21",
    "jest": "^29.7.0",
    "supertest": "^7.0.0",
    "ts-node": "^10.9.2",
    "typescript": "^5.4.5"
  }
}
"#;

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2022",
    "module": "commonjs",
    "outDir": "dist",
    "rootDir": "src",
    "strict": true,
    "esModuleInterop": true
  }
}
"#;

const REST_ENV: &str = r"PORT=3000
SERVICE_NAME={{service_name}}
ENVIRONMENT={{env}}
{{#if flags.database}}DATABASE_URL=postgres://localhost:5432/{{service_name}}
{{/if}}{{#if flags.redis}}REDIS_URL=redis://localhost:6379
{{/if}}{{#if flags.auth}}JWT_SECRET=change-me
{{/if}}";

const REST_INDEX: &str = r"import { createApp } from './app';

const port = Number(process.env.PORT ?? 3000);

createApp().listen(port, () => {
  console.log(`{{service_name}} listening on ${port}`);
});
";

const REST_APP: &str = r"import express from 'express';
import { healthRouter } from './routes/health';
{{#if flags.swagger}}import { mountDocs } from './swagger';
{{/if}}{{#if flags.auth}}import { requireAuth } from './middleware/auth';
{{/if}}
export function createApp() {
  const app = express();
  app.use(express.json());
  app.use('/health', healthRouter);
{{#if flags.swagger}}  mountDocs(app);
{{/if}}{{#if flags.auth}}  app.use('/api', requireAuth);
{{/if}}  return app;
}
";

const REST_HEALTH: &str = r"import { Router } from 'express';

export const healthRouter = Router();

healthRouter.get('/', (_req, res) => {
  res.json({ status: 'ok', service: '{{service_name}}' });
});
";

const REST_DB: &str = r"import { Pool } from 'pg';

export const pool = new Pool({ connectionString: process.env.DATABASE_URL });
";

const REST_CACHE: &str = r"import { createClient } from 'redis';

export const cache = createClient({ url: process.env.REDIS_URL });
";

const REST_SWAGGER: &str = r"import { Express } from 'express';
import swaggerUi from 'swagger-ui-express';

const spec = {
  openapi: '3.0.0',
  info: { title: '{{service_name}}', version: '0.1.0' },
  paths: {},
};

export function mountDocs(app: Express) {
  app.use('/docs', swaggerUi.serve, swaggerUi.setup(spec));
}
";

const REST_AUTH: &str = r"import { NextFunction, Request, Response } from 'express';
import jwt from 'jsonwebtoken';

export function requireAuth(req: Request, res: Response, next: NextFunction) {
  const header = req.headers.authorization ?? '';
  const token = header.replace(/^Bearer /, '');
  try {
    jwt.verify(token, process.env.JWT_SECRET ?? '');
    next();
  } catch {
    res.status(401).json({ error: 'unauthorized' });
  }
}
";

const REST_HEALTH_TEST: &str = r"import request from 'supertest';
import { createApp } from '../src/app';

test('health reports ok', async () => {
  const res = await request(createApp()).get('/health');
  expect(res.body.service).toBe('{{service_name}}');
});
";

const NODE_DOCKERFILE: &str = r#"FROM node:20-alpine
WORKDIR /app
COPY package*.json ./
RUN npm ci
COPY . .
RUN npm run build
EXPOSE 3000
CMD ["node", "dist/index.js"]
"#;

const REST_COMPOSE: &str = r#"services:
  app:
    build: .
    ports:
      - "3000:3000"
{{#if flags.database}}  postgres:
    image: postgres:16
    environment:
      POSTGRES_DB: {{service_name}}
      POSTGRES_PASSWORD: postgres
{{/if}}{{#if flags.redis}}  redis:
    image: redis:7
{{/if}}"#;

const WORKER_README: &str = r"# {{service_name}}

Background worker owned by {{owner}}, deployed to {{env}}.

    pip install -r requirements.txt
    python -m {{service_name}}.main
";

const WORKER_REQUIREMENTS: &str = r"celery==5.4.0
{{#if flags.redis}}redis==5.0.4
{{/if}}pytest==8.2.0
";

const WORKER_CONFIG: &str = r"import os

SERVICE_NAME = '{{service_name}}'
ENVIRONMENT = os.getenv('ENVIRONMENT', '{{env}}')
{{#if flags.redis}}BROKER_URL = os.getenv('REDIS_URL', 'redis://localhost:6379/0')
{{else}}BROKER_URL = os.getenv('BROKER_URL', 'memory://')
{{/if}}";

const WORKER_MAIN: &str = r"from celery import Celery

from . import config

app = Celery(config.SERVICE_NAME, broker=config.BROKER_URL)
app.autodiscover_tasks(['{{service_name}}'])
{{#if flags.scheduler}}
from .schedule import BEAT_SCHEDULE  # noqa: E402

app.conf.beat_schedule = BEAT_SCHEDULE
{{/if}}";

const WORKER_TASKS: &str = r"from celery import shared_task


@shared_task
def ping():
    return '{{service_name}}: pong'
";

const WORKER_SCHEDULE: &str = r"BEAT_SCHEDULE = {
    'ping-every-minute': {
        'task': '{{service_name}}.tasks.ping',
        'schedule': 60.0,
    },
}
";

const WORKER_TEST: &str = r"from {{service_name}}.tasks import ping


def test_ping():
    assert ping() == '{{service_name}}: pong'
";

const PYTHON_DOCKERFILE: &str = r#"FROM python:3.12-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY . .
CMD ["celery", "-A", "{{service_name}}.main", "worker", "--loglevel=info"]
"#;
